//! Message sender: POST one simulated inbound message to `{base}/scheduler/mobile-app`.
//!
//! Single attempt, no retry. Success means status 200 and nothing else.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::message::{EventType, OutboundMessage};

pub const SCHEDULER_PATH: &str = "/scheduler/mobile-app";

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned status {status}: {body}")]
    Protocol { status: u16, body: String },
}

/// Outcome of one send. Failures are values, never errors.
#[derive(Debug)]
pub struct SendResult {
    pub ok: bool,
    pub message_id: String,
    /// None when no response arrived (transport failure or timeout).
    pub http_status: Option<u16>,
    pub elapsed_ms: f64,
    /// Response body when it parsed as JSON.
    pub body: Option<Value>,
    /// Raw response text when it did not parse as JSON.
    pub text: Option<String>,
    pub error: Option<SendError>,
    /// Unix seconds the message was stamped with.
    pub sent_at: i64,
}

/// Sends simulated inbound messages. Holds no mutable state; clone or share freely.
#[derive(Clone)]
pub struct MessageSender {
    endpoint: String,
    device_token: String,
    client: reqwest::Client,
}

impl MessageSender {
    /// `base_url` is the backend root; the scheduler path is appended.
    pub fn new(
        base_url: &str,
        device_token: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), SCHEDULER_PATH),
            device_token: device_token.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn device_token(&self) -> &str {
        &self.device_token
    }

    /// Build a fresh message for `user_id` and post it.
    pub async fn send(&self, user_id: &str, text: &str, event_type: EventType) -> SendResult {
        let message = OutboundMessage::new(user_id, text, event_type, self.device_token.clone());
        self.deliver(&message).await
    }

    /// Post an already-built message.
    pub async fn deliver(&self, message: &OutboundMessage) -> SendResult {
        log::debug!(
            "POST {} user={} id={} text={:?}",
            self.endpoint,
            message.user_id,
            message.message_id,
            message.text
        );
        let start = Instant::now();
        let res = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(message)
            .send()
            .await;

        let mut result = SendResult {
            ok: false,
            message_id: message.message_id.clone(),
            http_status: None,
            elapsed_ms: 0.0,
            body: None,
            text: None,
            error: None,
            sent_at: message.sent_at,
        };

        let res = match res {
            Ok(r) => r,
            Err(e) => {
                result.elapsed_ms = elapsed_ms(start);
                log::warn!("send {} failed: {}", message.message_id, e);
                result.error = Some(SendError::Transport(e));
                return result;
            }
        };

        let status = res.status().as_u16();
        let raw = res.text().await.unwrap_or_default();
        result.elapsed_ms = elapsed_ms(start);
        result.http_status = Some(status);
        result.ok = status == 200;

        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(v) => result.body = Some(v),
                Err(_) => result.text = Some(raw.clone()),
            }
        }

        if !result.ok {
            log::warn!("send {} rejected with status {}", message.message_id, status);
            result.error = Some(SendError::Protocol { status, body: raw });
        }
        result
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
