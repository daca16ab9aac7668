//! Carrier webhook simulation: post Messenger-platform and Twilio SMS callbacks to the backend,
//! as if the carrier had delivered an inbound message.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::config::WebhookConfig;

/// Outcome of one simulated webhook call. `ok` is any 2xx.
#[derive(Debug, Clone)]
pub struct WebhookResult {
    pub endpoint: String,
    pub ok: bool,
    pub status: Option<u16>,
    pub elapsed_ms: f64,
    pub body: String,
    pub error: Option<String>,
}

pub struct WebhookSimulator {
    base_url: String,
    page_id: String,
    account_sid: String,
    client: reqwest::Client,
}

impl WebhookSimulator {
    pub fn new(
        base_url: &str,
        webhooks: &WebhookConfig,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            page_id: webhooks.page_id.clone(),
            account_sid: webhooks.account_sid.clone(),
            client,
        })
    }

    /// POST `{base}/facebook` with a page messaging event from `sender_id`.
    pub async fn simulate_facebook(&self, sender_id: &str, text: &str) -> WebhookResult {
        let endpoint = format!("{}/facebook", self.base_url);
        let payload = facebook_payload(&self.page_id, sender_id, text, chrono::Utc::now().timestamp_millis());
        let req = self.client.post(&endpoint).json(&payload);
        execute(endpoint, req).await
    }

    /// POST `{base}/twilio` with form-encoded SMS callback fields.
    pub async fn simulate_twilio(&self, from: &str, to: &str, body: &str) -> WebhookResult {
        let endpoint = format!("{}/twilio", self.base_url);
        let fields = twilio_fields(&self.account_sid, from, to, body);
        let req = self.client.post(&endpoint).form(&fields);
        execute(endpoint, req).await
    }
}

async fn execute(endpoint: String, req: reqwest::RequestBuilder) -> WebhookResult {
    let start = Instant::now();
    match req.send().await {
        Ok(res) => {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            WebhookResult {
                endpoint,
                ok: status.is_success(),
                status: Some(status.as_u16()),
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                body,
                error: None,
            }
        }
        Err(e) => {
            log::warn!("webhook {} failed: {}", endpoint, e);
            WebhookResult {
                endpoint,
                ok: false,
                status: None,
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                body: String::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

/// Messenger platform webhook body with a single text message event.
pub fn facebook_payload(page_id: &str, sender_id: &str, text: &str, timestamp_ms: i64) -> Value {
    json!({
        "object": "page",
        "entry": [{
            "id": page_id,
            "time": timestamp_ms,
            "messaging": [{
                "sender": { "id": sender_id },
                "recipient": { "id": page_id },
                "timestamp": timestamp_ms,
                "message": {
                    "mid": format!("m_{}", uuid::Uuid::new_v4().simple()),
                    "text": text
                }
            }]
        }]
    })
}

/// Twilio inbound SMS callback fields. `MessageSid` is `SM` + 32 hex chars.
pub fn twilio_fields(account_sid: &str, from: &str, to: &str, body: &str) -> Vec<(&'static str, String)> {
    vec![
        ("MessageSid", format!("SM{}", uuid::Uuid::new_v4().simple())),
        ("AccountSid", account_sid.to_string()),
        ("From", from.to_string()),
        ("To", to.to_string()),
        ("Body", body.to_string()),
        ("NumMedia", "0".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facebook_shape() {
        let p = facebook_payload("PAGE", "psid-1", "start", 1_700_000_000_000);
        assert_eq!(p["object"], "page");
        let event = &p["entry"][0]["messaging"][0];
        assert_eq!(event["sender"]["id"], "psid-1");
        assert_eq!(event["recipient"]["id"], "PAGE");
        assert_eq!(event["message"]["text"], "start");
        assert!(event["message"]["mid"].as_str().unwrap().starts_with("m_"));
    }

    #[test]
    fn twilio_fields_shape() {
        let f = twilio_fields("ACx", "+15550001", "+15550002", "hi");
        let sid = &f[0].1;
        assert_eq!(f[0].0, "MessageSid");
        assert!(sid.starts_with("SM"));
        assert_eq!(sid.len(), 34);
        assert!(f.contains(&("Body", "hi".to_string())));
        assert!(f.contains(&("NumMedia", "0".to_string())));
    }
}
