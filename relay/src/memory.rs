//! In-process relay used by tests, the simulator and the HTTP server.
//!
//! Subscribers are notified synchronously at write time, so per-record
//! ordering matches write order. Mutations never await while holding the
//! lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    CollectionSubscription, Filter, RecordSubscription, RelayError, RelayRecord, RelayStore,
    SubscriptionGuard,
};

#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, RelayRecord>>,
    record_subs: HashMap<u64, RecordSub>,
    collection_subs: HashMap<u64, CollectionSub>,
    next_sub_id: u64,
}

struct RecordSub {
    collection: String,
    record_id: String,
    tx: mpsc::UnboundedSender<Option<RelayRecord>>,
}

struct CollectionSub {
    collection: String,
    filter: Filter,
    tx: mpsc::UnboundedSender<Vec<RelayRecord>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn snapshot(&self, collection: &str, filter: &Filter) -> Vec<RelayRecord> {
        self.collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|record| filter.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notify(&mut self, collection: &str, record_id: &str) {
        let current = self
            .collections
            .get(collection)
            .and_then(|records| records.get(record_id))
            .cloned();

        self.record_subs.retain(|_, sub| {
            if sub.collection != collection || sub.record_id != record_id {
                return true;
            }
            sub.tx.send(current.clone()).is_ok()
        });

        let mut snapshots: Vec<(u64, Vec<RelayRecord>)> = Vec::new();
        for (id, sub) in &self.collection_subs {
            if sub.collection == collection {
                snapshots.push((*id, self.snapshot(collection, &sub.filter)));
            }
        }
        for (id, snapshot) in snapshots {
            if let Some(sub) = self.collection_subs.get(&id) {
                if sub.tx.send(snapshot).is_err() {
                    self.collection_subs.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn put(
        &self,
        collection: &str,
        id: &str,
        fields: Value,
        merge: bool,
    ) -> Result<(), RelayError> {
        let patch = match fields {
            Value::Object(map) => map,
            _ => return Err(RelayError::NonObjectFields),
        };

        let mut inner = self.inner.lock().expect("relay lock poisoned");
        let now = Utc::now();
        let records = inner.collections.entry(collection.to_string()).or_default();
        match records.get_mut(id) {
            Some(existing) if merge => {
                if let Value::Object(target) = &mut existing.fields {
                    for (key, value) in patch {
                        target.insert(key, value);
                    }
                }
                existing.updated = now;
            }
            Some(existing) => {
                existing.fields = Value::Object(patch);
                existing.updated = now;
            }
            None => {
                records.insert(
                    id.to_string(),
                    RelayRecord {
                        id: id.to_string(),
                        created: now,
                        updated: now,
                        fields: Value::Object(patch),
                    },
                );
            }
        }
        inner.notify(collection, id);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RelayRecord>, RelayError> {
        let inner = self.inner.lock().expect("relay lock poisoned");
        Ok(inner
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, RelayError> {
        let mut inner = self.inner.lock().expect("relay lock poisoned");
        let existed = inner
            .collections
            .get_mut(collection)
            .map(|records| records.remove(id).is_some())
            .unwrap_or(false);
        if existed {
            inner.notify(collection, id);
        }
        Ok(existed)
    }

    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<RelayRecord>, RelayError> {
        let inner = self.inner.lock().expect("relay lock poisoned");
        Ok(inner.snapshot(collection, filter))
    }

    async fn subscribe_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<RecordSubscription, RelayError> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("relay lock poisoned");
        let current = inner
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned();
        let _ = tx.send(current);

        let sub_id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.record_subs.insert(
            sub_id,
            RecordSub {
                collection: collection.to_string(),
                record_id: id.to_string(),
                tx,
            },
        );
        drop(inner);

        let weak = Arc::downgrade(&self.inner);
        let guard = SubscriptionGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.record_subs.remove(&sub_id);
                }
            }
        });
        Ok(RecordSubscription { events, guard })
    }

    async fn subscribe_collection(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<CollectionSubscription, RelayError> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("relay lock poisoned");
        let _ = tx.send(inner.snapshot(collection, &filter));

        let sub_id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.collection_subs.insert(
            sub_id,
            CollectionSub {
                collection: collection.to_string(),
                filter,
                tx,
            },
        );
        drop(inner);

        let weak = Arc::downgrade(&self.inner);
        let guard = SubscriptionGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.collection_subs.remove(&sub_id);
                }
            }
        });
        Ok(CollectionSubscription { events, guard })
    }
}
