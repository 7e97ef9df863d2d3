//! Anonymous pairing over the relay's queue collection.
//!
//! The claim primitive is ticket deletion: whoever deletes the partner's
//! queue ticket first owns the pairing. Everything else (user records,
//! partner pointers) follows from that, so two users claiming each other
//! concurrently converge on identical writes instead of conflicting.

use std::sync::Arc;

use relay::RelayStore;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::schema::{self, QueueStatus, QueueTicket, UserRecord};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Relay(#[from] relay::RelayError),
    #[error(transparent)]
    Schema(#[from] schema::SchemaError),
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub partner_id: String,
    pub initiated_locally: bool,
}

pub struct MatchmakingQueue {
    relay: Arc<dyn RelayStore>,
    user_id: String,
}

impl MatchmakingQueue {
    pub fn new(relay: Arc<dyn RelayStore>, user_id: String) -> Self {
        Self { relay, user_id }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Marks the local user queued and posts a ticket. Re-entrant: an
    /// existing ticket keeps its original join time.
    pub async fn enqueue(&self) -> Result<(), MatchError> {
        self.relay
            .put(
                schema::USERS,
                &self.user_id,
                UserRecord::queued(&self.user_id).to_fields(),
                true,
            )
            .await?;
        let existing = self.relay.get(schema::QUEUE, &self.user_id).await?;
        if existing.is_none() {
            self.relay
                .put(
                    schema::QUEUE,
                    &self.user_id,
                    QueueTicket::new(&self.user_id).to_fields(),
                    false,
                )
                .await?;
        }
        info!(user_id = %self.user_id, "joined matchmaking queue");
        Ok(())
    }

    /// Withdraws from the queue without pairing.
    pub async fn dequeue(&self) -> Result<(), MatchError> {
        self.relay.delete(schema::QUEUE, &self.user_id).await?;
        self.relay
            .put(
                schema::USERS,
                &self.user_id,
                serde_json::json!({
                    "user_id": self.user_id,
                    "queue_status": QueueStatus::None,
                    "partner_id": null,
                }),
                true,
            )
            .await?;
        Ok(())
    }

    /// Reacts to a queue snapshot: if we are still unpaired, try to claim
    /// the longest-waiting other user. Returns the pairing when a claim
    /// lands, `None` when there is nothing to do yet.
    pub async fn on_queue_change(
        &self,
        tickets: &[QueueTicket],
    ) -> Result<Option<Pairing>, MatchError> {
        let own = match self.relay.get(schema::USERS, &self.user_id).await? {
            Some(record) => UserRecord::from_record(&record)?,
            None => return Ok(None),
        };
        if own.queue_status != QueueStatus::Queued || own.partner_id.is_some() {
            return Ok(None);
        }

        // a claimer deletes our ticket before our record carries the partner
        // pointer; if neither is present any more we fell out of the queue
        // entirely and have to re-post
        if !tickets.iter().any(|t| t.user_id == self.user_id) {
            let present = self.relay.get(schema::QUEUE, &self.user_id).await?;
            if present.is_none() {
                warn!(user_id = %self.user_id, "queued with no ticket, re-posting");
                self.relay
                    .put(
                        schema::QUEUE,
                        &self.user_id,
                        QueueTicket::new(&self.user_id).to_fields(),
                        false,
                    )
                    .await?;
            }
        }

        let mut others: Vec<&QueueTicket> = tickets
            .iter()
            .filter(|t| t.user_id != self.user_id)
            .collect();
        if others.is_empty() {
            return Ok(None);
        }
        others.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        let candidate = others[0].user_id.clone();
        self.claim(&candidate).await
    }

    /// Attempts to claim `partner_id`. Deleting their ticket is the commit
    /// point; losing that race means someone else got them first.
    pub async fn claim(&self, partner_id: &str) -> Result<Option<Pairing>, MatchError> {
        let existed = self.relay.delete(schema::QUEUE, partner_id).await?;
        if !existed {
            debug!(partner_id, "ticket already consumed, claim abandoned");
            return Ok(None);
        }

        // between snapshot and claim our partner may have claimed a third
        // user's ticket and written us a pointer; honor the earlier pairing
        if let Some(record) = self.relay.get(schema::USERS, &self.user_id).await? {
            let own = UserRecord::from_record(&record)?;
            if let Some(existing) = own.partner_id {
                if existing != partner_id {
                    warn!(
                        partner_id,
                        existing = %existing,
                        "already paired elsewhere, abandoning claim"
                    );
                    return Ok(None);
                }
            }
        }

        self.relay.delete(schema::QUEUE, &self.user_id).await?;
        // own record first: when the partner wakes up on their record they
        // already find this side pointing back at them
        self.relay
            .put(
                schema::USERS,
                &self.user_id,
                serde_json::json!({
                    "user_id": self.user_id,
                    "queue_status": QueueStatus::Paired,
                    "partner_id": partner_id,
                }),
                true,
            )
            .await?;
        self.relay
            .put(
                schema::USERS,
                partner_id,
                serde_json::json!({
                    "user_id": partner_id,
                    "queue_status": QueueStatus::Paired,
                    "partner_id": self.user_id,
                }),
                true,
            )
            .await?;
        info!(user_id = %self.user_id, partner_id, "pairing claimed");
        Ok(Some(Pairing {
            partner_id: partner_id.to_string(),
            initiated_locally: true,
        }))
    }

    /// Dissolves the pairing. The partner's record is only touched while it
    /// still points back at us, so a partner already re-paired elsewhere is
    /// left alone.
    pub async fn unpair(&self, partner_id: &str) -> Result<(), MatchError> {
        if let Some(record) = self.relay.get(schema::USERS, partner_id).await? {
            let partner = UserRecord::from_record(&record)?;
            if partner.partner_id.as_deref() == Some(self.user_id.as_str()) {
                self.relay
                    .put(
                        schema::USERS,
                        partner_id,
                        serde_json::json!({
                            "user_id": partner_id,
                            "queue_status": QueueStatus::None,
                            "partner_id": null,
                        }),
                        true,
                    )
                    .await?;
            }
        }
        self.relay
            .put(
                schema::USERS,
                &self.user_id,
                serde_json::json!({
                    "user_id": self.user_id,
                    "queue_status": QueueStatus::None,
                    "partner_id": null,
                }),
                true,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay::{
        CollectionSubscription, Filter, MemoryRelay, RecordSubscription, RelayError, RelayRecord,
    };
    use serde_json::Value;
    use std::sync::Mutex;

    fn queue(relay: &MemoryRelay, user: &str) -> MatchmakingQueue {
        MatchmakingQueue::new(Arc::new(relay.clone()), user.to_string())
    }

    /// Delegating store that logs the order of writes.
    #[derive(Clone)]
    struct RecordingRelay {
        inner: MemoryRelay,
        puts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RelayStore for RecordingRelay {
        async fn put(
            &self,
            collection: &str,
            id: &str,
            fields: Value,
            merge: bool,
        ) -> Result<(), RelayError> {
            self.puts
                .lock()
                .unwrap()
                .push(format!("{collection}/{id}"));
            self.inner.put(collection, id, fields, merge).await
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Option<RelayRecord>, RelayError> {
            self.inner.get(collection, id).await
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<bool, RelayError> {
            self.inner.delete(collection, id).await
        }

        async fn list(
            &self,
            collection: &str,
            filter: &Filter,
        ) -> Result<Vec<RelayRecord>, RelayError> {
            self.inner.list(collection, filter).await
        }

        async fn subscribe_record(
            &self,
            collection: &str,
            id: &str,
        ) -> Result<RecordSubscription, RelayError> {
            self.inner.subscribe_record(collection, id).await
        }

        async fn subscribe_collection(
            &self,
            collection: &str,
            filter: Filter,
        ) -> Result<CollectionSubscription, RelayError> {
            self.inner.subscribe_collection(collection, filter).await
        }
    }

    async fn tickets(relay: &MemoryRelay) -> Vec<QueueTicket> {
        relay
            .list(schema::QUEUE, &relay::Filter::All)
            .await
            .unwrap()
            .iter()
            .map(|r| QueueTicket::from_record(r).unwrap())
            .collect()
    }

    async fn user(relay: &MemoryRelay, id: &str) -> UserRecord {
        let record = relay.get(schema::USERS, id).await.unwrap().unwrap();
        UserRecord::from_record(&record).unwrap()
    }

    #[tokio::test]
    async fn lone_user_stays_queued() {
        let relay = MemoryRelay::default();
        let alice = queue(&relay, "alice");
        alice.enqueue().await.unwrap();

        let snapshot = tickets(&relay).await;
        assert!(alice.on_queue_change(&snapshot).await.unwrap().is_none());
        assert_eq!(user(&relay, "alice").await.queue_status, QueueStatus::Queued);
        assert_eq!(tickets(&relay).await.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let relay = MemoryRelay::default();
        let alice = queue(&relay, "alice");
        alice.enqueue().await.unwrap();
        let first = tickets(&relay).await;
        alice.enqueue().await.unwrap();
        let second = tickets(&relay).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn claim_pairs_both_records_and_clears_tickets() {
        let relay = MemoryRelay::default();
        let alice = queue(&relay, "alice");
        let bob = queue(&relay, "bob");
        alice.enqueue().await.unwrap();
        bob.enqueue().await.unwrap();

        let snapshot = tickets(&relay).await;
        let pairing = bob.on_queue_change(&snapshot).await.unwrap().unwrap();
        assert_eq!(pairing.partner_id, "alice");

        assert!(tickets(&relay).await.is_empty());
        let a = user(&relay, "alice").await;
        let b = user(&relay, "bob").await;
        assert_eq!(a.queue_status, QueueStatus::Paired);
        assert_eq!(a.partner_id.as_deref(), Some("bob"));
        assert_eq!(b.queue_status, QueueStatus::Paired);
        assert_eq!(b.partner_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn claim_publishes_own_pairing_before_the_partners() {
        let inner = MemoryRelay::default();
        let puts = Arc::new(Mutex::new(Vec::new()));
        let store = RecordingRelay {
            inner: inner.clone(),
            puts: puts.clone(),
        };
        inner
            .put(
                schema::QUEUE,
                "alice",
                QueueTicket::new("alice").to_fields(),
                false,
            )
            .await
            .unwrap();

        let bob = MatchmakingQueue::new(Arc::new(store), "bob".to_string());
        bob.enqueue().await.unwrap();
        bob.claim("alice").await.unwrap().unwrap();

        // a watcher woken by either record must already find bob committed,
        // so bob's own pairing write has to land first
        let log = puts.lock().unwrap().clone();
        let partner_pos = log
            .iter()
            .position(|p| p == "users/alice")
            .expect("partner record written");
        let own_pos = log
            .iter()
            .rposition(|p| p == "users/bob")
            .expect("own record written");
        assert!(own_pos < partner_pos, "writes arrived as {log:?}");
    }

    #[tokio::test]
    async fn consumed_ticket_abandons_claim() {
        let relay = MemoryRelay::default();
        let alice = queue(&relay, "alice");
        alice.enqueue().await.unwrap();

        // bob saw carol's ticket in a stale snapshot, but it is gone
        let bob = queue(&relay, "bob");
        bob.enqueue().await.unwrap();
        assert!(bob.claim("carol").await.unwrap().is_none());
        // bob's own ticket survives the abandoned claim
        assert!(relay.get(schema::QUEUE, "bob").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_honors_existing_pairing() {
        let relay = MemoryRelay::default();
        let alice = queue(&relay, "alice");
        let bob = queue(&relay, "bob");
        let carol = queue(&relay, "carol");
        alice.enqueue().await.unwrap();
        bob.enqueue().await.unwrap();
        carol.enqueue().await.unwrap();

        // carol claims alice; alice then reacts to a stale snapshot that
        // still shows bob available
        carol.claim("alice").await.unwrap().unwrap();
        let stale = tickets(&relay).await;
        assert!(alice.on_queue_change(&stale).await.unwrap().is_none());
        assert_eq!(user(&relay, "alice").await.partner_id.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn missing_ticket_is_reposted() {
        let relay = MemoryRelay::default();
        let alice = queue(&relay, "alice");
        alice.enqueue().await.unwrap();
        // a crashed claimer deleted the ticket but never wrote the pairing
        relay.delete(schema::QUEUE, "alice").await.unwrap();

        assert!(alice.on_queue_change(&[]).await.unwrap().is_none());
        assert!(relay.get(schema::QUEUE, "alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unpair_leaves_repaired_partner_alone() {
        let relay = MemoryRelay::default();
        let alice = queue(&relay, "alice");
        let bob = queue(&relay, "bob");
        alice.enqueue().await.unwrap();
        bob.enqueue().await.unwrap();
        bob.claim("alice").await.unwrap().unwrap();

        // alice moved on to carol before bob noticed the call ended
        relay
            .put(
                schema::USERS,
                "alice",
                serde_json::json!({"partner_id": "carol"}),
                true,
            )
            .await
            .unwrap();
        bob.unpair("alice").await.unwrap();

        assert_eq!(user(&relay, "alice").await.partner_id.as_deref(), Some("carol"));
        let b = user(&relay, "bob").await;
        assert_eq!(b.queue_status, QueueStatus::None);
        assert!(b.partner_id.is_none());
    }
}
