use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use once_cell::sync::OnceCell;
use prometheus::{register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder};
use tokio::net::TcpListener;
use tracing::error;

use crate::BoxError;

pub const METRICS_PATH: &str = "/metrics";

/// Metric set for the pairing/call lifecycle.
pub struct SessionMetrics {
    pub sessions_started_total: IntCounter,
    pub pairings_total: IntCounter,
    pub calls_connected_total: IntCounter,
    pub active_sessions: IntGauge,
    pub queue_depth: IntGauge,
}

impl SessionMetrics {
    pub fn on_startup(&self) {
        self.sessions_started_total.inc_by(0);
        self.pairings_total.inc_by(0);
        self.calls_connected_total.inc_by(0);
        self.active_sessions.set(0);
        self.queue_depth.set(0);
    }
}

static SESSION_METRICS: OnceCell<SessionMetrics> = OnceCell::new();

pub fn session_metrics() -> &'static SessionMetrics {
    SESSION_METRICS.get_or_init(|| SessionMetrics {
        sessions_started_total: register_int_counter!(
            "call_sessions_started_total",
            "Total sessions that entered the matchmaking queue"
        )
        .expect("register call_sessions_started_total"),
        pairings_total: register_int_counter!(
            "call_pairings_total",
            "Total pairings claimed by this process"
        )
        .expect("register call_pairings_total"),
        calls_connected_total: register_int_counter!(
            "call_calls_connected_total",
            "Total calls that reached the connected state"
        )
        .expect("register call_calls_connected_total"),
        active_sessions: register_int_gauge!(
            "call_active_sessions",
            "Session coordinators currently running"
        )
        .expect("register call_active_sessions"),
        queue_depth: register_int_gauge!(
            "call_queue_depth",
            "Tickets visible in the last matchmaking queue snapshot"
        )
        .expect("register call_queue_depth"),
    })
}

pub fn metrics_router(metrics_path: &'static str) -> Router {
    Router::new().route(metrics_path, get(metrics_handler))
}

pub async fn serve_metrics(
    listener: TcpListener,
    metrics_path: &'static str,
) -> Result<(), BoxError> {
    let router = metrics_router(metrics_path);
    axum::serve(listener, router)
        .await
        .map_err(|err| Box::new(err) as BoxError)
}

pub fn spawn_metrics_exporter(
    addr: SocketAddr,
    metrics_path: &'static str,
    service_name: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = serve_metrics(listener, metrics_path).await {
                    error!(%err, service = service_name, %addr, path = metrics_path, "metrics exporter stopped unexpectedly");
                }
            }
            Err(err) => {
                error!(%err, service = service_name, %addr, path = metrics_path, "metrics exporter failed to bind");
            }
        }
    })
}

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(%err, "metrics: encode failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let body = match String::from_utf8(buffer) {
        Ok(text) => text,
        Err(err) => {
            error!(%err, "metrics: invalid UTF-8");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(body))
        .unwrap()
}
