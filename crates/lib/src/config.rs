//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.rcs-probe/config.json`) and environment.
//! Nothing here is hardcoded: the backend URL, device token and store credentials all come from
//! the file or env.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Messaging backend (scheduler + webhooks).
    #[serde(default)]
    pub backend: BackendConfig,

    /// Push registration used as `fcmToken` on every send.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Remote delivery-log store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Participant id -> external id.
    #[serde(default)]
    pub participants: BTreeMap<String, String>,

    /// Webhook simulation settings.
    #[serde(default)]
    pub webhooks: WebhookConfig,
}

/// Backend URL, timeout and user agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL of the messaging backend, e.g. `https://example.ngrok.io`. Overridden by RCS_BASE_URL.
    pub base_url: Option<String>,

    /// Request timeout in seconds (default 10).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "RCS-Testing/1.0".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Push-notification registration token. Overridden by RCS_DEVICE_TOKEN.
    pub fcm_token: Option<String>,
}

/// Firestore settings for the delivery log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Google Cloud project id. Falls back to the service account's project_id.
    pub project_id: Option<String>,

    /// Service-account JSON. Overridden by GOOGLE_APPLICATION_CREDENTIALS. When absent, requests are
    /// sent unauthenticated (emulator).
    pub credentials_path: Option<PathBuf>,

    /// REST base URL (default https://firestore.googleapis.com). Point at an emulator for local runs.
    #[serde(default = "default_store_base_url")]
    pub base_url: String,

    /// Top-level collection keyed by external id (default "messages").
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Per-user sub-collection holding delivery records (default "chat").
    #[serde(default = "default_subcollection")]
    pub subcollection: String,

    /// Watch polling interval in milliseconds (default 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of newest records each watch query looks at (default 10).
    #[serde(default = "default_watch_limit")]
    pub watch_limit: u32,
}

fn default_store_base_url() -> String {
    "https://firestore.googleapis.com".to_string()
}

fn default_collection() -> String {
    "messages".to_string()
}

fn default_subcollection() -> String {
    "chat".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_watch_limit() -> u32 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            credentials_path: None,
            base_url: default_store_base_url(),
            collection: default_collection(),
            subcollection: default_subcollection(),
            poll_interval_ms: default_poll_interval_ms(),
            watch_limit: default_watch_limit(),
        }
    }
}

/// Page id and Twilio account used when simulating carrier webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default = "default_page_id")]
    pub page_id: String,
    #[serde(default = "default_account_sid")]
    pub account_sid: String,
}

fn default_page_id() -> String {
    "PAGE_ID".to_string()
}

fn default_account_sid() -> String {
    "ACtest".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            page_id: default_page_id(),
            account_sid: default_account_sid(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the backend base URL: env RCS_BASE_URL overrides config. Trailing slashes are trimmed.
pub fn resolve_base_url(config: &Config) -> Option<String> {
    non_empty_env("RCS_BASE_URL")
        .or_else(|| {
            config
                .backend
                .base_url
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .map(|s| s.trim_end_matches('/').to_string())
}

/// Like [`resolve_base_url`] but a missing value is a configuration error.
pub fn require_base_url(config: &Config) -> Result<String> {
    resolve_base_url(config).ok_or_else(|| {
        anyhow::anyhow!("backend base URL not configured; set backend.baseUrl or RCS_BASE_URL")
    })
}

/// Resolve the device token: env RCS_DEVICE_TOKEN overrides config. Empty string when unset.
pub fn resolve_device_token(config: &Config) -> String {
    non_empty_env("RCS_DEVICE_TOKEN")
        .or_else(|| {
            config
                .device
                .fcm_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_default()
}

/// Resolve the service-account path: env GOOGLE_APPLICATION_CREDENTIALS overrides config.
pub fn resolve_credentials_path(config: &Config) -> Option<PathBuf> {
    non_empty_env("GOOGLE_APPLICATION_CREDENTIALS")
        .map(PathBuf::from)
        .or_else(|| config.store.credentials_path.clone())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RCS_PROBE_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".rcs-probe").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or RCS_PROBE_CONFIG_PATH). Missing
/// file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
