//! Shared document-store boundary used as the signaling transport.
//!
//! The store holds named records grouped into collections and pushes change
//! notifications to subscribers. Delivery is at-least-once and eventually
//! consistent: per-record updates are observed in write order, but there is no
//! ordering across distinct records and no exactly-once guarantee, so
//! consumers are expected to apply notifications idempotently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod http;
pub mod memory;
pub mod server;

pub use http::HttpRelay;
pub use memory::MemoryRelay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("record fields must be a JSON object")]
    NonObjectFields,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay API error: {message} (status {status})")]
    Api { status: u16, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A stored record. `fields` is always a JSON object; schema validation is
/// the caller's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub fields: Value,
}

/// Server-side filter for collection reads and subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    FieldEq { field: String, value: Value },
}

impl Filter {
    pub fn field_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::FieldEq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &RelayRecord) -> bool {
        match self {
            Filter::All => true,
            Filter::FieldEq { field, value } => record.fields.get(field) == Some(value),
        }
    }
}

/// Detaches the underlying listener when dropped or explicitly unsubscribed.
/// Cancellation is synchronous: once `unsubscribe` returns, no further
/// notification is queued by the relay for this subscription.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Notification stream for a single record: `None` means the record is
/// absent. The current value is delivered immediately on subscribe.
pub struct RecordSubscription {
    pub events: mpsc::UnboundedReceiver<Option<RelayRecord>>,
    pub guard: SubscriptionGuard,
}

impl RecordSubscription {
    pub async fn recv(&mut self) -> Option<Option<RelayRecord>> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Option<RelayRecord>>, SubscriptionGuard) {
        (self.events, self.guard)
    }
}

/// Notification stream for a filtered collection. Each event is a snapshot of
/// the currently matching records; snapshots over-approximate "added or
/// changed" which keeps handlers idempotent under at-least-once delivery.
pub struct CollectionSubscription {
    pub events: mpsc::UnboundedReceiver<Vec<RelayRecord>>,
    pub guard: SubscriptionGuard,
}

impl CollectionSubscription {
    pub async fn recv(&mut self) -> Option<Vec<RelayRecord>> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Vec<RelayRecord>>, SubscriptionGuard) {
        (self.events, self.guard)
    }
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Create or overwrite a record. With `merge` only the given fields are
    /// patched and the rest of the record is left alone.
    async fn put(
        &self,
        collection: &str,
        id: &str,
        fields: Value,
        merge: bool,
    ) -> Result<(), RelayError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RelayRecord>, RelayError>;

    /// Returns `false` when the record was already absent. Deleting an absent
    /// record is a no-op, not an error; matchmaking leans on this.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, RelayError>;

    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<RelayRecord>, RelayError>;

    async fn subscribe_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<RecordSubscription, RelayError>;

    async fn subscribe_collection(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<CollectionSubscription, RelayError>;
}
