//! REST client for a relay served over HTTP (see [`crate::server`]).
//!
//! Change subscriptions are polling tasks that diff record `updated`
//! timestamps. That keeps the transport plain request/response while still
//! honoring the at-least-once, eventually-consistent delivery contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    CollectionSubscription, Filter, RecordSubscription, RelayError, RelayRecord, RelayStore,
    SubscriptionGuard,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemsBody {
    pub items: Vec<RelayRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteBody {
    pub existed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutQuery {
    pub merge: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListQuery {
    pub filter_field: Option<String>,
    pub filter_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpRelay {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<(), RelayError> {
        let url = format!("{}/api/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/api/collections/{}/records/{}",
            self.base_url, collection, id
        )
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }
}

async fn api_error(response: reqwest::Response) -> RelayError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    RelayError::Api { status, message }
}

fn filter_query(filter: &Filter) -> Vec<(&'static str, String)> {
    match filter {
        Filter::All => Vec::new(),
        Filter::FieldEq { field, value } => vec![
            ("filter_field", field.clone()),
            ("filter_value", value.to_string()),
        ],
    }
}

#[async_trait]
impl RelayStore for HttpRelay {
    async fn put(
        &self,
        collection: &str,
        id: &str,
        fields: Value,
        merge: bool,
    ) -> Result<(), RelayError> {
        if !fields.is_object() {
            return Err(RelayError::NonObjectFields);
        }
        let response = self
            .client
            .put(self.record_url(collection, id))
            .query(&[("merge", merge)])
            .json(&fields)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RelayRecord>, RelayError> {
        let response = self
            .client
            .get(self.record_url(collection, id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, RelayError> {
        let response = self
            .client
            .delete(self.record_url(collection, id))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body: DeleteBody = response.json().await?;
        Ok(body.existed)
    }

    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<RelayRecord>, RelayError> {
        let response = self
            .client
            .get(self.collection_url(collection))
            .query(&filter_query(filter))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body: ItemsBody = response.json().await?;
        Ok(body.items)
    }

    async fn subscribe_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<RecordSubscription, RelayError> {
        let (tx, events) = mpsc::unbounded_channel();
        let client = self.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        let poll = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut last: Option<Option<DateTime<Utc>>> = None;
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                let current = match RelayStore::get(&client, &collection, &id).await {
                    Ok(current) => current,
                    Err(err) => {
                        debug!(%err, %collection, record = %id, "relay poll failed, will retry");
                        continue;
                    }
                };
                let fingerprint = current.as_ref().map(|record| record.updated);
                if last.as_ref() != Some(&fingerprint) {
                    if tx.send(current).is_err() {
                        break;
                    }
                    last = Some(fingerprint);
                }
            }
        });

        let guard = SubscriptionGuard::new(move || handle.abort());
        Ok(RecordSubscription { events, guard })
    }

    async fn subscribe_collection(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<CollectionSubscription, RelayError> {
        let (tx, events) = mpsc::unbounded_channel();
        let client = self.clone();
        let collection = collection.to_string();
        let poll = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut last: Option<Vec<(String, DateTime<Utc>)>> = None;
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                let snapshot = match RelayStore::list(&client, &collection, &filter).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        debug!(%err, %collection, "relay poll failed, will retry");
                        continue;
                    }
                };
                let mut fingerprint: Vec<(String, DateTime<Utc>)> = snapshot
                    .iter()
                    .map(|record| (record.id.clone(), record.updated))
                    .collect();
                fingerprint.sort();
                if last.as_ref() != Some(&fingerprint) {
                    if tx.send(snapshot).is_err() {
                        break;
                    }
                    last = Some(fingerprint);
                }
            }
        });

        let guard = SubscriptionGuard::new(move || handle.abort());
        Ok(CollectionSubscription { events, guard })
    }
}
