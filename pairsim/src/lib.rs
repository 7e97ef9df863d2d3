//! Pairing simulator: spins up a fleet of session coordinators against a
//! shared relay and reports how many reached a connected call. Doubles as a
//! load harness for the relay server.

use std::{fs, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use call_net::peer::{LoopbackPeerFactory, StaticMedia};
use call_net::{metrics, shutdown, SessionConfig, SessionCoordinator, SessionState};
use relay::{HttpRelay, MemoryRelay, RelayStore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    Memory,
    Http,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SimSettings {
    pub users: usize,
    pub relay: RelayMode,
    pub relay_url: Option<String>,
    pub metrics_addr: Option<String>,
    pub offer_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub requeue_on_failure: bool,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            users: 2,
            relay: RelayMode::Memory,
            relay_url: None,
            metrics_addr: None,
            offer_timeout_ms: 20_000,
            connect_timeout_ms: 10_000,
            requeue_on_failure: true,
        }
    }
}

impl SimSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let mut settings = Self::default();
        if let Ok(raw) = std::env::var("PAIRSIM_USERS") {
            settings.users = raw.parse().map_err(|err| boxed("PAIRSIM_USERS", err))?;
        }
        if let Ok(raw) = std::env::var("PAIRSIM_RELAY") {
            settings.relay = match raw.as_str() {
                "memory" => RelayMode::Memory,
                "http" => RelayMode::Http,
                other => return Err(format!("PAIRSIM_RELAY unknown mode {other:?}").into()),
            };
        }
        if let Ok(raw) = std::env::var("PAIRSIM_RELAY_URL") {
            settings.relay_url = Some(raw);
        }
        if let Ok(raw) = std::env::var("PAIRSIM_METRICS_ADDR") {
            settings.metrics_addr = Some(raw);
        }
        if let Ok(raw) = std::env::var("PAIRSIM_OFFER_TIMEOUT_MS") {
            settings.offer_timeout_ms = raw
                .parse()
                .map_err(|err| boxed("PAIRSIM_OFFER_TIMEOUT_MS", err))?;
        }
        if let Ok(raw) = std::env::var("PAIRSIM_CONNECT_TIMEOUT_MS") {
            settings.connect_timeout_ms = raw
                .parse()
                .map_err(|err| boxed("PAIRSIM_CONNECT_TIMEOUT_MS", err))?;
        }
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path).map_err(|err| Box::new(err) as BoxError)?;
        let settings = serde_json::from_str(&raw).map_err(|err| Box::new(err) as BoxError)?;
        Ok(settings)
    }

    pub fn into_config(self) -> SimConfig {
        SimConfig {
            session: SessionConfig {
                offer_timeout: Duration::from_millis(self.offer_timeout_ms),
                requeue_on_failure: self.requeue_on_failure,
                ..SessionConfig::default()
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            users: self.users,
            relay: self.relay,
            relay_url: self.relay_url,
            metrics_addr: self.metrics_addr,
        }
    }
}

fn boxed(var: &str, err: impl std::error::Error + Send + Sync + 'static) -> BoxError {
    format!("{var}: {err}").into()
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub users: usize,
    pub relay: RelayMode,
    pub relay_url: Option<String>,
    pub metrics_addr: Option<String>,
    pub session: SessionConfig,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReport {
    pub users: usize,
    pub connected: usize,
}

pub async fn run() -> Result<SimReport, BoxError> {
    let config = SimSettings::from_env()?.into_config();
    run_with_ctrl_c(config).await
}

pub async fn run_with_ctrl_c(config: SimConfig) -> Result<SimReport, BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let ctrl_c = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "pairsim: cannot listen for ctrl_c");
        }
        shutdown::trigger(&shutdown_tx);
    });

    let result = run_with_shutdown(config, shutdown_rx).await;

    ctrl_c.abort();
    result
}

pub async fn run_with_shutdown(
    config: SimConfig,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<SimReport, BoxError> {
    if let Some(addr) = config.metrics_addr.as_deref() {
        let addr: SocketAddr = addr.parse().map_err(|err| boxed("metrics_addr", err))?;
        metrics::session_metrics().on_startup();
        metrics::spawn_metrics_exporter(addr, metrics::METRICS_PATH, "pairsim");
    }

    let store = build_relay(&config).await?;

    let peers = Arc::new(LoopbackPeerFactory::default());
    let media = Arc::new(StaticMedia::default());
    let mut handles = Vec::with_capacity(config.users);
    let mut tasks: JoinSet<()> = JoinSet::new();
    for index in 0..config.users {
        let (handle, task) = SessionCoordinator::spawn(
            store.clone(),
            format!("user-{index:04}"),
            config.session.clone(),
            peers.clone(),
            media.clone(),
            shutdown_rx.clone(),
        );
        tasks.spawn(async move {
            if let Err(err) = task.await {
                error!(%err, "coordinator task panicked");
            }
        });
        handles.push(handle);
    }
    for handle in &handles {
        handle.join_queue();
    }
    info!(users = config.users, "simulation fleet queued");

    let mut connected = 0;
    for handle in &mut handles {
        tokio::select! {
            _ = shutdown::wait(shutdown_rx.clone()) => break,
            reached = timeout(config.connect_timeout, handle.wait_for(SessionState::Connected)) => {
                match reached {
                    Ok(true) => connected += 1,
                    Ok(false) => break,
                    Err(_) => warn!("user never connected within the timeout"),
                }
            }
        }
    }
    info!(connected, users = config.users, "simulation settled");

    for handle in &handles {
        handle.leave();
    }
    for handle in &mut handles {
        let _ = timeout(Duration::from_secs(5), handle.wait_for(SessionState::Ended)).await;
    }
    drop(handles);
    while tasks.join_next().await.is_some() {}

    Ok(SimReport {
        users: config.users,
        connected,
    })
}

async fn build_relay(config: &SimConfig) -> Result<Arc<dyn RelayStore>, BoxError> {
    match config.relay {
        RelayMode::Memory => Ok(Arc::new(MemoryRelay::default())),
        RelayMode::Http => {
            let url = match config.relay_url.clone() {
                Some(url) => url,
                None => {
                    // no server given: host one ourselves on a loopback port
                    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                        .await
                        .map_err(|err| Box::new(err) as BoxError)?;
                    let addr = listener.local_addr().map_err(|err| Box::new(err) as BoxError)?;
                    tokio::spawn(async move {
                        if let Err(err) = relay::server::serve(listener, MemoryRelay::default()).await
                        {
                            error!(%err, "embedded relay server stopped");
                        }
                    });
                    info!(%addr, "embedded relay server listening");
                    format!("http://{addr}")
                }
            };
            Ok(Arc::new(
                HttpRelay::new(&url).with_poll_interval(Duration::from_millis(50)),
            ))
        }
    }
}
