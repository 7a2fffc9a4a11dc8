//! voxlink: voice channels from the terminal.

mod audio;
mod config;
mod console;
mod realtime;
mod relay;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use voxlink_protocol::UserId;
use voxlink_voice::{
    format_duration, BroadcastTransport, CaptureConstraints, FallbackSession, LocalBroadcastHub,
    LocalCaptureStream, PeerConnector, ResourceGuard, StaticDirectory, VoiceClient, VoiceConfig,
    VoiceMessageRecorder, VoiceMessageRelay, VoiceMessageTarget, VoiceResult, VoiceSession,
};

use crate::audio::{AudioMixer, AudioPlayback, CpalDevices, MixerOutput, PLAYBACK_SAMPLE_RATE};
use crate::config::{RealtimeConfig, RelayConfig};
use crate::console::{print_json, ConsoleHandler};
use crate::realtime::RealtimeTransport;
use crate::relay::HttpVoiceMessageRelay;

#[derive(Parser)]
#[command(name = "voxlink", version, about = "Voice channels over a broadcast relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input and output devices
    Devices,
    /// Join a channel's voice session
    Join(JoinArgs),
    /// Record a voice message and send it
    Record(RecordArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Direct peer connections (needs the `webrtc` feature)
    Peer,
    /// Audio fragments broadcast through the relay
    Fallback,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportKind {
    /// The hosted realtime service
    Realtime,
    /// In-process loopback, for trying things out alone
    Local,
}

#[derive(Args)]
struct JoinArgs {
    #[arg(long)]
    channel: String,
    #[arg(long)]
    user: String,
    #[arg(long, value_enum, default_value_t = Mode::Fallback)]
    mode: Mode,
    #[arg(long, value_enum, default_value_t = TransportKind::Realtime)]
    transport: TransportKind,
    /// Input device name
    #[arg(long)]
    input: Option<String>,
    /// Output device name
    #[arg(long)]
    output: Option<String>,
}

#[derive(Args)]
struct RecordArgs {
    #[arg(long)]
    user: String,
    /// Send to everyone in a channel
    #[arg(long, conflicts_with = "to", required_unless_present = "to")]
    channel: Option<String>,
    /// Send to one user
    #[arg(long)]
    to: Option<String>,
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,
    #[arg(long)]
    input: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxlink=debug,voxlink_voice=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Devices => devices(),
        Command::Join(args) => join(args).await,
        Command::Record(args) => record(args).await,
    }
}

fn devices() -> Result<()> {
    let (inputs, outputs) = audio::list_devices().context("Failed to enumerate audio devices")?;
    print_json(&json!({ "inputs": inputs, "outputs": outputs }));
    Ok(())
}

#[cfg(feature = "webrtc")]
fn peer_connector(config: &VoiceConfig) -> Result<Arc<dyn PeerConnector>> {
    let connector = voxlink_voice::WebRtcConnector::new(config)
        .context("Failed to set up the media engine")?;
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "webrtc"))]
fn peer_connector(_config: &VoiceConfig) -> Result<Arc<dyn PeerConnector>> {
    bail!("peer mode needs a build with the `webrtc` feature; try --mode fallback")
}

/// What the stdin loop can do with either kind of session
#[async_trait]
trait Controls: Send + Sync {
    async fn set_transmit(&self, on: bool) -> VoiceResult<()>;
    fn print_status(&self);
    async fn leave(&self) -> VoiceResult<()>;
}

#[async_trait]
impl Controls for VoiceSession {
    async fn set_transmit(&self, on: bool) -> VoiceResult<()> {
        if on {
            self.start_transmitting().await
        } else {
            self.stop_transmitting().await
        }
    }

    fn print_status(&self) {
        print_json(&self.status());
    }

    async fn leave(&self) -> VoiceResult<()> {
        self.disconnect().await
    }
}

#[async_trait]
impl Controls for FallbackSession {
    async fn set_transmit(&self, on: bool) -> VoiceResult<()> {
        if on {
            self.start_transmission().await
        } else {
            self.stop_transmission().await
        }
    }

    fn print_status(&self) {
        print_json(&self.status());
    }

    async fn leave(&self) -> VoiceResult<()> {
        self.disconnect().await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Toggle,
    Status,
    Deafen,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    match line.trim() {
        "t" => Some(Input::Toggle),
        "s" => Some(Input::Status),
        "d" => Some(Input::Deafen),
        "q" => Some(Input::Quit),
        _ => None,
    }
}

async fn join(args: JoinArgs) -> Result<()> {
    let config = VoiceConfig::from_env();
    let transport: Arc<dyn BroadcastTransport> = match args.transport {
        TransportKind::Realtime => {
            let realtime: Arc<dyn BroadcastTransport> =
                RealtimeTransport::connect(&RealtimeConfig::from_env()?).await?;
            realtime
        }
        TransportKind::Local => LocalBroadcastHub::new(),
    };

    let mixer = Arc::new(Mutex::new(AudioMixer::new(PLAYBACK_SAMPLE_RATE)));
    let playback = AudioPlayback::start(args.output.clone(), mixer.clone())
        .context("Failed to start speaker playback")?;

    let client = VoiceClient::new(
        Arc::new(CpalDevices::new(args.input.clone())),
        transport,
        Arc::new(StaticDirectory::new(args.user.as_str(), args.channel.as_str())),
    )
    .with_config(config);

    info!("Joining {} as {} ({:?} mode)", args.channel, args.user, args.mode);
    let session: Box<dyn Controls> = match args.mode {
        Mode::Peer => {
            let connector = peer_connector(client.config())?;
            let client = client.with_connector(connector);
            let handler = Arc::new(ConsoleHandler::new(mixer.clone(), true));
            Box::new(client.initialize_session(handler).await?)
        }
        Mode::Fallback => {
            let handler = Arc::new(ConsoleHandler::new(mixer.clone(), false));
            let output = Arc::new(MixerOutput::new(mixer.clone(), &playback));
            Box::new(client.initialize_fallback(output, handler).await?)
        }
    };
    eprintln!("t = talk on/off, s = status, d = deafen, q = quit");

    let result = control_loop(session.as_ref(), &mixer).await;
    session.leave().await?;
    if let Ok(mut mixer) = mixer.lock() {
        mixer.clear();
    }
    drop(playback);
    result
}

async fn control_loop(session: &dyn Controls, mixer: &Mutex<AudioMixer>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut transmitting = false;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        match parse_input(&line) {
            Some(Input::Toggle) => {
                transmitting = !transmitting;
                session.set_transmit(transmitting).await?;
                eprintln!("{}", if transmitting { "Talking" } else { "Muted" });
            }
            Some(Input::Status) => {
                session.print_status();
                if let Ok(mut mixer) = mixer.lock() {
                    print_json(&json!({ "levels": mixer.levels() }));
                }
            }
            Some(Input::Deafen) => {
                if let Ok(mut mixer) = mixer.lock() {
                    let muted = !mixer.is_muted();
                    mixer.set_muted(muted);
                    eprintln!("{}", if muted { "Deafened" } else { "Listening" });
                }
            }
            Some(Input::Quit) => return Ok(()),
            None => warn!("Unknown command {:?}", line.trim()),
        }
    }
}

async fn record(args: RecordArgs) -> Result<()> {
    let target = match (args.channel, args.to) {
        (Some(channel), _) => VoiceMessageTarget::Channel(channel.into()),
        (None, Some(user)) => VoiceMessageTarget::User(user.into()),
        (None, None) => bail!("either --channel or --to is required"),
    };
    let relay = HttpVoiceMessageRelay::new(&RelayConfig::from_env()?);
    let config = VoiceConfig::from_env();

    let devices = CpalDevices::new(args.input);
    let guard = ResourceGuard::new();
    let mut capture = LocalCaptureStream::acquire(
        &devices,
        &guard,
        CaptureConstraints::voice(config.sample_rate),
    )
    .await
    .context("Cannot open the microphone")?;
    let mut track = capture.track();
    capture.set_enabled(true);

    let mut recorder = VoiceMessageRecorder::new(UserId::from(args.user), config.sample_rate, 1);
    recorder.start()?;
    eprintln!("Recording for {} (Ctrl-C stops early)", format_duration(args.seconds));

    let deadline = tokio::time::sleep(Duration::from_secs_f64(args.seconds.max(0.1)));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            frame = track.next_frame() => match frame {
                Some(frame) => {
                    recorder.push(&frame)?;
                }
                None => break,
            },
        }
    }
    capture.stop();

    let draft = recorder.finish()?;
    info!("Recorded {} ({})", draft.id, format_duration(draft.duration));
    let receipt = relay.send(&draft.to_request(&target)).await?;
    print_json(&json!({
        "messageId": receipt.message_id,
        "duration": format_duration(draft.duration),
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("t\n"), Some(Input::Toggle));
        assert_eq!(parse_input(" q "), Some(Input::Quit));
        assert_eq!(parse_input("talk"), None);
    }

    #[test]
    fn test_record_needs_a_target() {
        let parsed = Cli::try_parse_from(["voxlink", "record", "--user", "u1"]);
        assert!(parsed.is_err());

        let parsed =
            Cli::try_parse_from(["voxlink", "record", "--user", "u1", "--channel", "c", "--to", "u2"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["voxlink", "record", "--user", "u1", "--to", "u2"]);
        assert!(parsed.is_ok());
    }

    #[test]
    fn test_join_defaults() {
        let cli = Cli::try_parse_from(["voxlink", "join", "--channel", "c", "--user", "u"]).unwrap();
        match cli.command {
            Command::Join(args) => {
                assert!(matches!(args.mode, Mode::Fallback));
                assert!(matches!(args.transport, TransportKind::Realtime));
            }
            _ => panic!("expected join"),
        }
    }
}
