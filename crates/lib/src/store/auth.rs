//! Service-account OAuth2 for the store: sign an RS256 assertion, exchange it for an access token,
//! cache the token until shortly before it expires.

use std::path::Path;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::StoreError;

const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the cached token expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The fields of a Google service-account key file that the token flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccount {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let s = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Credentials(format!("reading {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&s)
            .map_err(|e| StoreError::Credentials(format!("parsing {}: {}", path.display(), e)))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Hands out bearer tokens for one service account.
pub struct TokenProvider {
    account: ServiceAccount,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(account: ServiceAccount, client: reqwest::Client) -> Self {
        Self {
            account,
            client,
            cached: Mutex::new(None),
        }
    }

    pub fn account(&self) -> &ServiceAccount {
        &self.account
    }

    /// A valid access token, fetching a new one when the cached token is missing or near expiry.
    pub async fn access_token(&self) -> Result<String, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if c.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(c.token.clone());
            }
        }

        let assertion = build_assertion(&self.account, now)?;
        log::debug!("requesting store access token for {}", self.account.client_email);
        let res = self
            .client
            .post(&self.account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Credentials(format!(
                "token exchange failed: {} {}",
                status, body
            )));
        }
        let data: TokenResponse = res.json().await?;
        let token = data.access_token.clone();
        *cached = Some(CachedToken {
            token: data.access_token,
            expires_at: now + data.expires_in,
        });
        Ok(token)
    }
}

fn build_assertion(account: &ServiceAccount, now: i64) -> Result<String, StoreError> {
    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
        .map_err(|e| StoreError::Credentials(format!("invalid private key: {}", e)))?;
    let claims = AssertionClaims {
        iss: &account.client_email,
        scope: DATASTORE_SCOPE,
        aud: &account.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| StoreError::Credentials(format!("signing assertion: {}", e)))
}
