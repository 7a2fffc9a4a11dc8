use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Fragment container magic
pub const FRAGMENT_MAGIC: [u8; 2] = *b"VX";

/// Current container version
pub const FRAGMENT_VERSION: u8 = 1;

/// Header size for a fragment container:
/// - 2 bytes: magic
/// - 1 byte: version
/// - 1 byte: codec
/// - 4 bytes: sample rate
/// - 1 byte: channel count
pub const FRAGMENT_HEADER_SIZE: usize = 9;

/// Sample rates a fragment may declare, in Hz
pub const SUPPORTED_SAMPLE_RATES: std::ops::RangeInclusive<u32> = 8_000..=192_000;

/// Most channels a fragment may declare
pub const MAX_CHANNELS: u8 = 8;

/// Whether audio in this format can be played back and resampled
pub fn is_supported_format(sample_rate: u32, channels: u8) -> bool {
    SUPPORTED_SAMPLE_RATES.contains(&sample_rate) && (1..=MAX_CHANNELS).contains(&channels)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Corrupt fragment: {0}")]
    Corrupt(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Payload encodings a fragment may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AudioCodec {
    /// Signed 16-bit little-endian PCM
    Pcm16 = 0x01,
    /// G.711 µ-law, one byte per sample
    MuLaw = 0x02,
}

impl AudioCodec {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Pcm16),
            0x02 => Some(Self::MuLaw),
            _ => None,
        }
    }
}

/// Decoded audio: interleaved signed 16-bit samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    pub sample_rate: u32,
    pub channels: u8,
    pub samples: Vec<i16>,
}

impl PcmFrame {
    pub fn new(sample_rate: u32, channels: u8, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Wrap a frame in the fragment container
pub fn encode_fragment(frame: &PcmFrame, codec: AudioCodec) -> Vec<u8> {
    let body_len = match codec {
        AudioCodec::Pcm16 => frame.samples.len() * 2,
        AudioCodec::MuLaw => frame.samples.len(),
    };

    let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + body_len);
    buf.extend_from_slice(&FRAGMENT_MAGIC);
    buf.push(FRAGMENT_VERSION);
    buf.push(codec as u8);
    buf.extend_from_slice(&frame.sample_rate.to_be_bytes());
    buf.push(frame.channels);

    match codec {
        AudioCodec::Pcm16 => {
            for sample in &frame.samples {
                buf.extend_from_slice(&sample.to_le_bytes());
            }
        }
        AudioCodec::MuLaw => buf.extend(frame.samples.iter().map(|&s| mulaw_encode(s))),
    }

    buf
}

/// Parse a fragment container back into PCM
pub fn decode_fragment(data: &[u8]) -> DecodeResult<PcmFrame> {
    if data.len() < FRAGMENT_HEADER_SIZE {
        return Err(DecodeError::Corrupt(format!(
            "{} bytes is shorter than the header",
            data.len()
        )));
    }

    if data[0..2] != FRAGMENT_MAGIC {
        return Err(DecodeError::UnsupportedEncoding(format!(
            "unknown magic {:02X}{:02X}",
            data[0], data[1]
        )));
    }
    if data[2] != FRAGMENT_VERSION {
        return Err(DecodeError::UnsupportedEncoding(format!(
            "container version {}",
            data[2]
        )));
    }
    let codec = AudioCodec::from_byte(data[3])
        .ok_or_else(|| DecodeError::UnsupportedEncoding(format!("codec 0x{:02X}", data[3])))?;

    let sample_rate = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let channels = data[8];
    if sample_rate == 0 || channels == 0 {
        return Err(DecodeError::Corrupt(format!(
            "invalid format {sample_rate} Hz / {channels} channels"
        )));
    }
    if !is_supported_format(sample_rate, channels) {
        return Err(DecodeError::UnsupportedEncoding(format!(
            "{sample_rate} Hz / {channels} channels"
        )));
    }

    let body = &data[FRAGMENT_HEADER_SIZE..];
    let samples = match codec {
        AudioCodec::Pcm16 => {
            if body.len() % 2 != 0 {
                return Err(DecodeError::Corrupt(format!(
                    "odd PCM body length {}",
                    body.len()
                )));
            }
            body.chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect()
        }
        AudioCodec::MuLaw => body.iter().map(|&b| mulaw_decode(b)).collect(),
    };

    Ok(PcmFrame {
        sample_rate,
        channels,
        samples,
    })
}

/// Base64 transport encoding for broadcast payloads
pub fn to_transport(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn from_transport(text: &str) -> DecodeResult<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// G.711 µ-law compress one sample
pub fn mulaw_encode(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) as u8 | mantissa as u8)
}

/// G.711 µ-law expand one sample
pub fn mulaw_decode(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> PcmFrame {
        let samples = (0..len).map(|i| ((i as i32 * 517) % 20000 - 10000) as i16).collect();
        PcmFrame::new(48000, 1, samples)
    }

    #[test]
    fn test_pcm_fragment() {
        let frame = tone(4800);
        let bytes = encode_fragment(&frame, AudioCodec::Pcm16);
        assert_eq!(bytes.len(), FRAGMENT_HEADER_SIZE + 9600);

        let decoded = decode_fragment(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.duration_ms(), 100);
    }

    #[test]
    fn test_mulaw_is_close() {
        let frame = tone(160);
        let decoded = decode_fragment(&encode_fragment(&frame, AudioCodec::MuLaw)).unwrap();
        assert_eq!(decoded.samples.len(), frame.samples.len());
        for (a, b) in frame.samples.iter().zip(&decoded.samples) {
            let tolerance = (a.unsigned_abs() as i32 / 16).max(16);
            assert!((*a as i32 - *b as i32).abs() <= tolerance, "{a} vs {b}");
        }
        assert_eq!(mulaw_decode(mulaw_encode(0)), 0);
    }

    #[test]
    fn test_rejects_foreign_payloads() {
        // A webm/opus blob as produced by a browser recorder
        let webm = [0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x86, 0x81, 0x01, 0x42];
        assert!(matches!(
            decode_fragment(&webm),
            Err(DecodeError::UnsupportedEncoding(_))
        ));

        let mut bytes = encode_fragment(&tone(10), AudioCodec::Pcm16);
        bytes[3] = 0x7F;
        assert!(matches!(
            decode_fragment(&bytes),
            Err(DecodeError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn test_rejects_unplayable_formats() {
        let mut bytes = encode_fragment(&tone(10), AudioCodec::Pcm16);
        bytes[4..8].copy_from_slice(&4_294_967_291u32.to_be_bytes());
        assert!(matches!(
            decode_fragment(&bytes),
            Err(DecodeError::UnsupportedEncoding(_))
        ));

        let mut bytes = encode_fragment(&tone(10), AudioCodec::Pcm16);
        bytes[4..8].copy_from_slice(&4_000u32.to_be_bytes());
        assert!(matches!(
            decode_fragment(&bytes),
            Err(DecodeError::UnsupportedEncoding(_))
        ));

        let mut bytes = encode_fragment(&tone(10), AudioCodec::Pcm16);
        bytes[8] = 200;
        assert!(matches!(
            decode_fragment(&bytes),
            Err(DecodeError::UnsupportedEncoding(_))
        ));

        let narrowband = PcmFrame::new(8000, 2, vec![0; 16]);
        assert!(decode_fragment(&encode_fragment(&narrowband, AudioCodec::MuLaw)).is_ok());
    }

    #[test]
    fn test_rejects_corrupt_payloads() {
        assert!(matches!(decode_fragment(b"VX"), Err(DecodeError::Corrupt(_))));

        let mut bytes = encode_fragment(&tone(10), AudioCodec::Pcm16);
        bytes.pop();
        assert!(matches!(decode_fragment(&bytes), Err(DecodeError::Corrupt(_))));

        let mut bytes = encode_fragment(&tone(10), AudioCodec::Pcm16);
        bytes[8] = 0;
        assert!(matches!(decode_fragment(&bytes), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_transport_encoding() {
        let bytes = encode_fragment(&tone(32), AudioCodec::Pcm16);
        let text = to_transport(&bytes);
        assert_eq!(from_transport(&text).unwrap(), bytes);
        assert!(matches!(
            from_transport("not*base64!"),
            Err(DecodeError::InvalidBase64(_))
        ));
    }
}
