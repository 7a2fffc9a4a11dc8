//! Voice-message relay over the hosted `send-voice-message` function.

use async_trait::async_trait;
use tracing::{debug, info};

use voxlink_voice::{
    RelayError, SendVoiceMessageReceipt, SendVoiceMessageRequest, VoiceMessageRelay,
};

use crate::config::RelayConfig;

const SEND_FUNCTION: &str = "send-voice-message";

pub struct HttpVoiceMessageRelay {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpVoiceMessageRelay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint(SEND_FUNCTION),
            api_key: config.api_key.clone(),
        }
    }
}

/// Turn an HTTP reply into a receipt, or the reason it was refused
fn interpret(status: reqwest::StatusCode, body: &str) -> Result<SendVoiceMessageReceipt, RelayError> {
    let receipt: SendVoiceMessageReceipt = match serde_json::from_str(body) {
        Ok(receipt) => receipt,
        Err(e) if status.is_success() => {
            return Err(RelayError::Request(format!("unreadable reply: {e}")));
        }
        Err(_) => return Err(RelayError::Rejected(format!("HTTP {status}"))),
    };

    if !status.is_success() || !receipt.success {
        let reason = receipt
            .error
            .clone()
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(RelayError::Rejected(reason));
    }
    Ok(receipt)
}

#[async_trait]
impl VoiceMessageRelay for HttpVoiceMessageRelay {
    async fn send(
        &self,
        request: &SendVoiceMessageRequest,
    ) -> Result<SendVoiceMessageReceipt, RelayError> {
        debug!(
            "Relaying {:.1}s voice message from {} to {}",
            request.duration, request.sender_id, self.endpoint
        );
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let receipt = interpret(status, &body)?;
        info!(
            "Voice message stored as {}",
            receipt.message_id.as_deref().unwrap_or("?")
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_success_receipt() {
        let receipt = interpret(
            StatusCode::OK,
            r#"{"success":true,"messageId":"m-1","message":"Voice message sent successfully"}"#,
        )
        .unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn test_error_reply_is_rejected() {
        let result = interpret(
            StatusCode::BAD_REQUEST,
            r#"{"error":"Audio data and sender ID are required"}"#,
        );
        match result {
            Err(RelayError::Rejected(reason)) => {
                assert_eq!(reason, "Audio data and sender ID are required")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_json_failure() {
        assert!(matches!(
            interpret(StatusCode::BAD_GATEWAY, "<html>"),
            Err(RelayError::Rejected(_))
        ));
        assert!(matches!(
            interpret(StatusCode::OK, "<html>"),
            Err(RelayError::Request(_))
        ));
    }
}
