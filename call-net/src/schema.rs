//! Record schemas shared through the relay. Every record type validates at
//! the boundary: relay fields are untyped JSON, `from_record` turns them into
//! a typed value or a decode error, never a panic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use relay::RelayRecord;

use crate::peer::{IceCandidate, SessionDescription};

pub const USERS: &str = "users";
pub const QUEUE: &str = "queue";
pub const CALLS: &str = "calls";
pub const CANDIDATES: &str = "candidates";
pub const CHAT_MESSAGES: &str = "chat_messages";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid {collection} record {id}: {source}")]
    Decode {
        collection: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

fn decode<T: serde::de::DeserializeOwned>(
    collection: &'static str,
    record: &RelayRecord,
) -> Result<T, SchemaError> {
    serde_json::from_value(record.fields.clone()).map_err(|source| SchemaError::Decode {
        collection,
        id: record.id.clone(),
        source,
    })
}

/// Deterministic call id for a user pair: both sides compute the same record
/// name without coordinating.
pub fn call_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}__{hi}")
}

/// The lexically smaller user id creates the offer; both sides agree without
/// exchanging a message.
pub fn is_offerer(local_id: &str, partner_id: &str) -> bool {
    local_id < partner_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    None,
    Queued,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub queue_status: QueueStatus,
    #[serde(default)]
    pub partner_id: Option<String>,
}

impl UserRecord {
    pub fn queued(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            queue_status: QueueStatus::Queued,
            partner_id: None,
        }
    }

    pub fn to_fields(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "queue_status": self.queue_status,
            "partner_id": self.partner_id,
        })
    }

    pub fn from_record(record: &RelayRecord) -> Result<Self, SchemaError> {
        decode(USERS, record)
    }
}

/// Ephemeral queue membership. Record id is the user id, which enforces at
/// most one live ticket per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTicket {
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
}

impl QueueTicket {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            joined_at: Utc::now(),
        }
    }

    pub fn to_fields(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "joined_at": self.joined_at,
        })
    }

    pub fn from_record(record: &RelayRecord) -> Result<Self, SchemaError> {
        decode(QUEUE, record)
    }
}

/// One negotiation attempt between exactly two users. The record's existence
/// is the coordination primitive: created by the offerer, deleted by
/// whichever side ends the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub offerer_id: String,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn to_fields(&self) -> Value {
        json!({
            "call_id": self.call_id,
            "offerer_id": self.offerer_id,
            "offer": self.offer,
            "answer": self.answer,
            "created_at": self.created_at,
        })
    }

    pub fn from_record(record: &RelayRecord) -> Result<Self, SchemaError> {
        decode(CALLS, record)
    }
}

/// One trickled ICE candidate. Candidates get their own collection rather
/// than an array on the call record: the relay only has single-document
/// writes, and both sides append concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub call_id: String,
    pub sender_id: String,
    pub candidate: IceCandidate,
    pub posted_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn to_fields(&self) -> Value {
        json!({
            "call_id": self.call_id,
            "sender_id": self.sender_id,
            "candidate": self.candidate,
            "posted_at": self.posted_at,
        })
    }

    pub fn from_record(record: &RelayRecord) -> Result<Self, SchemaError> {
        decode(CANDIDATES, record)
    }
}

/// Chat overlay message, scoped to a call and cleared with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub call_id: String,
    pub sender_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessageRecord {
    pub fn to_fields(&self) -> Value {
        json!({
            "call_id": self.call_id,
            "sender_id": self.sender_id,
            "text": self.text,
            "sent_at": self.sent_at,
        })
    }

    pub fn from_record(record: &RelayRecord) -> Result<Self, SchemaError> {
        decode(CHAT_MESSAGES, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay::{MemoryRelay, RelayStore};

    #[test]
    fn call_id_is_symmetric() {
        assert_eq!(call_id("alice", "bob"), call_id("bob", "alice"));
        assert_eq!(call_id("alice", "bob"), "alice__bob");
    }

    #[test]
    fn exactly_one_offerer_per_pair() {
        assert!(is_offerer("alice", "bob"));
        assert!(!is_offerer("bob", "alice"));
    }

    #[tokio::test]
    async fn user_record_round_trips_through_relay() {
        let relay = MemoryRelay::new();
        let user = UserRecord::queued("u1");
        relay.put(USERS, "u1", user.to_fields(), false).await.unwrap();

        let record = relay.get(USERS, "u1").await.unwrap().unwrap();
        let decoded = UserRecord::from_record(&record).unwrap();
        assert_eq!(decoded, user);
    }

    #[tokio::test]
    async fn malformed_record_is_a_decode_error() {
        let relay = MemoryRelay::new();
        relay
            .put(USERS, "u1", serde_json::json!({"queue_status": "flying"}), false)
            .await
            .unwrap();

        let record = relay.get(USERS, "u1").await.unwrap().unwrap();
        assert!(UserRecord::from_record(&record).is_err());
    }
}
