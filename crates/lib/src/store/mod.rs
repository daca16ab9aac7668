//! Remote delivery log (read-only).
//!
//! The log is owned by the backend: a Firestore collection keyed by external user id, with a
//! per-user sub-collection of delivery records. This module only reads it.

mod auth;
mod firestore;
mod record;
mod value;

pub use auth::{ServiceAccount, TokenProvider};
pub use firestore::FirestoreLog;
pub use record::{normalize_timestamp, DeliveryRecord, MessageSource, MILLIS_THRESHOLD};
pub use value::{decode_fields, decode_value};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store api error: {0}")]
    Api(String),
    #[error("store credentials: {0}")]
    Credentials(String),
    #[error("unexpected store response: {0}")]
    Decode(String),
}

/// Read access to one user's delivery log.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Up to `limit` records for `external_id`, ordered by `createdAt` descending as the store
    /// returns them.
    async fn recent(&self, external_id: &str, limit: u32) -> Result<Vec<DeliveryRecord>, StoreError>;
}
