//! Minimal HTTP surface over a [`MemoryRelay`], wire-compatible with
//! [`crate::HttpRelay`]. Used by the integration tests and by the simulator
//! when it self-hosts its relay.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde_json::Value;
use tracing::warn;

use crate::http::{DeleteBody, ItemsBody, ListQuery, PutQuery};
use crate::{Filter, MemoryRelay, RelayRecord, RelayStore};

pub fn router(relay: MemoryRelay) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/collections/:collection/records", get(list_records))
        .route(
            "/api/collections/:collection/records/:id",
            put(put_record).get(get_record).delete(delete_record),
        )
        .with_state(relay)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    relay: MemoryRelay,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(relay)).await
}

async fn health() -> &'static str {
    "ok"
}

async fn put_record(
    State(relay): State<MemoryRelay>,
    Path((collection, id)): Path<(String, String)>,
    Query(query): Query<PutQuery>,
    Json(fields): Json<Value>,
) -> StatusCode {
    match relay
        .put(&collection, &id, fields, query.merge.unwrap_or(false))
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(%err, %collection, record = %id, "put rejected");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn get_record(
    State(relay): State<MemoryRelay>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<RelayRecord>, StatusCode> {
    match relay.get(&collection, &id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn delete_record(
    State(relay): State<MemoryRelay>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<DeleteBody>, StatusCode> {
    match relay.delete(&collection, &id).await {
        Ok(existed) => Ok(Json(DeleteBody { existed })),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn list_records(
    State(relay): State<MemoryRelay>,
    Path(collection): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ItemsBody>, StatusCode> {
    let filter = match (query.filter_field, query.filter_value) {
        (Some(field), Some(raw)) => {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            Filter::FieldEq { field, value }
        }
        _ => Filter::All,
    };
    match relay.list(&collection, &filter).await {
        Ok(items) => Ok(Json(ItemsBody { items })),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
