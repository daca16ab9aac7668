//! Firestore REST client for the delivery log: `runQuery` against
//! `{collection}/{external_id}/{subcollection}`, newest first.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

use super::auth::{ServiceAccount, TokenProvider};
use super::record::DeliveryRecord;
use super::value::decode_fields;
use super::{DeliveryLog, StoreError};
use crate::config::{self, Config};

const STORE_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

/// Delivery log backed by Firestore (or its emulator when no credentials are given).
pub struct FirestoreLog {
    base_url: String,
    project_id: String,
    collection: String,
    subcollection: String,
    client: reqwest::Client,
    auth: Option<TokenProvider>,
}

impl FirestoreLog {
    pub fn new(
        base_url: &str,
        project_id: impl Into<String>,
        collection: impl Into<String>,
        subcollection: impl Into<String>,
        auth: Option<TokenProvider>,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(STORE_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            collection: collection.into(),
            subcollection: subcollection.into(),
            client,
            auth,
        })
    }

    /// Build from config: credentials from GOOGLE_APPLICATION_CREDENTIALS or `store.credentialsPath`,
    /// project id from `store.projectId` or the service account.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let auth = match config::resolve_credentials_path(config) {
            Some(path) => {
                let account = ServiceAccount::load(&path)?;
                Some(TokenProvider::new(account, reqwest::Client::new()))
            }
            None => {
                log::info!("no store credentials configured; sending unauthenticated store requests");
                None
            }
        };
        let project_id = config
            .store
            .project_id
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| auth.as_ref().and_then(|a| a.account().project_id.clone()))
            .ok_or_else(|| {
                StoreError::Credentials(
                    "store project id not configured; set store.projectId or use a service account".to_string(),
                )
            })?;
        Self::new(
            &config.store.base_url,
            project_id,
            config.store.collection.clone(),
            config.store.subcollection.clone(),
            auth,
        )
    }

    /// `.../documents/{collection}/{external_id}:runQuery`
    pub fn query_url(&self, external_id: &str) -> String {
        format!(
            "{}/v1/projects/{}/databases/(default)/documents/{}/{}:runQuery",
            self.base_url, self.project_id, self.collection, external_id
        )
    }

    pub fn query_body(&self, limit: u32) -> Value {
        serde_json::json!({
            "structuredQuery": {
                "from": [{ "collectionId": self.subcollection }],
                "orderBy": [{
                    "field": { "fieldPath": "createdAt" },
                    "direction": "DESCENDING"
                }],
                "limit": limit
            }
        })
    }
}

#[async_trait]
impl DeliveryLog for FirestoreLog {
    async fn recent(&self, external_id: &str, limit: u32) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut req = self
            .client
            .post(self.query_url(external_id))
            .json(&self.query_body(limit));
        if let Some(auth) = &self.auth {
            req = req.bearer_auth(auth.access_token().await?);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Api(format!("{} {}", status, body)));
        }
        let items: Vec<RunQueryItem> = res
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(items
            .into_iter()
            .filter_map(|i| i.document)
            .map(|doc| {
                let id = doc.name.rsplit('/').next().unwrap_or_default().to_string();
                DeliveryRecord::from_fields(id, &decode_fields(&doc.fields))
            })
            .collect())
    }
}
