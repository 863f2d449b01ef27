//! Collector contract — the pluggable unit the engine drives.
//!
//! A collector knows how to fetch data for one collection type and how to
//! persist the fetched payload. It is constructed fresh for every execution,
//! bound to that task's parameters, and never mutates task state itself.

use async_trait::async_trait;
use thiserror::Error;

use crate::task::CollectionType;

/// Fetched items, shape known only to the collector.
pub type Payload = Vec<serde_json::Value>;

/// Where a payload was persisted plus a description of the run.
#[derive(Debug, Clone)]
pub struct StoredOutput {
    /// Opaque locator; `None` when there was nothing to store.
    pub storage_location: Option<String>,
    /// Source, date range, filters. Observability, not contract.
    pub metadata: serde_json::Value,
}

impl StoredOutput {
    /// The store result for an empty payload. Not an error.
    pub fn empty() -> Self {
        Self {
            storage_location: None,
            metadata: serde_json::json!({"count": 0}),
        }
    }
}

/// How a collect or store attempt failed.
///
/// Both variants currently consume the same retry budget; the split exists
/// so a short-circuit policy for permanent errors stays a local change.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Network, timeout, rate limit. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Bad or missing parameters. Retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// One collection type's fetch-and-persist capability.
#[async_trait]
pub trait Collector: Send + Sync {
    fn collection_type(&self) -> CollectionType;

    /// Fetch from the upstream source. Must not touch task state.
    async fn collect(&self) -> Result<Payload, CollectError>;

    /// Persist the payload and return its locator plus run metadata.
    /// An empty payload yields [`StoredOutput::empty`].
    async fn store(&self, payload: Payload) -> Result<StoredOutput, CollectError>;
}
