//! Local media/negotiation endpoint lifecycle.
//!
//! The real peer connection (SDP semantics, NAT traversal) stays behind the
//! [`PeerEndpoint`] trait; descriptions and candidates are opaque blobs. The
//! bundled [`LoopbackPeer`] stands in for it in tests and the simulator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no live connection")]
    NoConnection,
    #[error("local media already attached")]
    MediaAlreadyAttached,
    #[error("media source unavailable: {0}")]
    MediaUnavailable(String),
    #[error("endpoint failure: {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// SDP-like session description blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

/// Opaque network-reachability descriptor trickled between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: String,
}

/// Opaque handle over the local camera/microphone acquisition.
#[derive(Debug, Clone, Default)]
pub struct MediaSource {
    pub tracks: Vec<MediaTrack>,
}

pub trait MediaSourceProvider: Send + Sync {
    fn acquire(&self) -> Result<MediaSource, PeerError>;
}

/// Always hands out the same pre-built source.
pub struct StaticMedia {
    source: MediaSource,
}

impl StaticMedia {
    pub fn new(source: MediaSource) -> Self {
        Self { source }
    }
}

impl Default for StaticMedia {
    fn default() -> Self {
        Self {
            source: MediaSource {
                tracks: vec![
                    MediaTrack {
                        id: "mic-0".to_string(),
                        kind: "audio".to_string(),
                    },
                    MediaTrack {
                        id: "cam-0".to_string(),
                        kind: "video".to_string(),
                    },
                ],
            },
        }
    }
}

impl MediaSourceProvider for StaticMedia {
    fn acquire(&self) -> Result<MediaSource, PeerError> {
        Ok(self.source.clone())
    }
}

/// Models the user denying camera/microphone access.
pub struct DeniedMedia;

impl MediaSourceProvider for DeniedMedia {
    fn acquire(&self) -> Result<MediaSource, PeerError> {
        Err(PeerError::MediaUnavailable("permission denied".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    Track(MediaTrack),
    ConnectionState(PeerConnectionState),
}

/// Standard negotiation surface of the underlying connection object.
/// `Send + Sync` so a coordinator holding one stays spawnable.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn add_track(&mut self, track: MediaTrack) -> Result<(), PeerError>;
    async fn close(&mut self);
}

pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        ice_servers: &[String],
    ) -> Result<(Box<dyn PeerEndpoint>, mpsc::UnboundedReceiver<PeerEvent>), PeerError>;
}

/// Owns at most one live endpoint at a time and keeps its teardown
/// idempotent.
pub struct PeerConnectionController {
    factory: std::sync::Arc<dyn PeerFactory>,
    endpoint: Option<Box<dyn PeerEndpoint>>,
    media_attached: bool,
}

impl PeerConnectionController {
    pub fn new(factory: std::sync::Arc<dyn PeerFactory>) -> Self {
        Self {
            factory,
            endpoint: None,
            media_attached: false,
        }
    }

    /// Allocates a fresh endpoint. Any prior endpoint is fully closed first:
    /// never two live connections for one user.
    pub async fn create(
        &mut self,
        ice_servers: &[String],
    ) -> Result<mpsc::UnboundedReceiver<PeerEvent>, PeerError> {
        self.close().await;
        let (endpoint, events) = self.factory.create(ice_servers)?;
        self.endpoint = Some(endpoint);
        self.media_attached = false;
        Ok(events)
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Adds every track of the local source, exactly once per endpoint.
    pub async fn attach_local_media(&mut self, source: &MediaSource) -> Result<(), PeerError> {
        if self.media_attached {
            return Err(PeerError::MediaAlreadyAttached);
        }
        let endpoint = self.endpoint.as_mut().ok_or(PeerError::NoConnection)?;
        for track in &source.tracks {
            endpoint.add_track(track.clone()).await?;
        }
        self.media_attached = true;
        Ok(())
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        let endpoint = self.endpoint.as_mut().ok_or(PeerError::NoConnection)?;
        let offer = endpoint.create_offer().await?;
        endpoint.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        let endpoint = self.endpoint.as_mut().ok_or(PeerError::NoConnection)?;
        let answer = endpoint.create_answer().await?;
        endpoint.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        let endpoint = self.endpoint.as_mut().ok_or(PeerError::NoConnection)?;
        endpoint.set_remote_description(desc).await
    }

    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        let endpoint = self.endpoint.as_mut().ok_or(PeerError::NoConnection)?;
        endpoint.add_ice_candidate(candidate).await
    }

    /// Releases the endpoint. Double-close is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.close().await;
        }
        self.media_attached = false;
    }
}

/// Channel-backed stand-in for a real peer connection. Emits host candidates
/// after the local description lands and reports `Connected` once both
/// descriptions are in.
pub struct LoopbackPeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    local_set: bool,
    remote_set: bool,
    closed: bool,
    connect: bool,
    candidate_seq: u32,
}

impl LoopbackPeer {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn maybe_finish(&mut self) {
        if self.local_set && self.remote_set {
            if self.connect {
                self.emit(PeerEvent::Track(MediaTrack {
                    id: "remote-0".to_string(),
                    kind: "video".to_string(),
                }));
                self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
            } else {
                self.emit(PeerEvent::ConnectionState(PeerConnectionState::Failed));
            }
        }
    }
}

#[async_trait]
impl PeerEndpoint for LoopbackPeer {
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        if self.closed {
            return Err(PeerError::NoConnection);
        }
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: format!("v=0 loopback offer {}", Uuid::new_v4()),
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        if self.closed {
            return Err(PeerError::NoConnection);
        }
        if !self.remote_set {
            return Err(PeerError::Endpoint(
                "create_answer before remote offer".to_string(),
            ));
        }
        Ok(SessionDescription {
            kind: DescriptionKind::Answer,
            sdp: format!("v=0 loopback answer {}", Uuid::new_v4()),
        })
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::NoConnection);
        }
        debug!(kind = ?desc.kind, "local description set");
        self.local_set = true;
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connecting));
        for _ in 0..2 {
            self.candidate_seq += 1;
            self.emit(PeerEvent::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2130706431 127.0.0.1 9000 typ host",
                    self.candidate_seq
                ),
            }));
        }
        self.maybe_finish();
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::NoConnection);
        }
        debug!(kind = ?desc.kind, "remote description set");
        self.remote_set = true;
        self.maybe_finish();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, _candidate: IceCandidate) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::NoConnection);
        }
        Ok(())
    }

    async fn add_track(&mut self, _track: MediaTrack) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::NoConnection);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.emit(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        }
    }
}

pub struct LoopbackPeerFactory {
    pub connect: bool,
}

impl Default for LoopbackPeerFactory {
    fn default() -> Self {
        Self { connect: true }
    }
}

impl LoopbackPeerFactory {
    /// Endpoints that report `Failed` instead of `Connected`.
    pub fn failing() -> Self {
        Self { connect: false }
    }
}

impl PeerFactory for LoopbackPeerFactory {
    fn create(
        &self,
        _ice_servers: &[String],
    ) -> Result<(Box<dyn PeerEndpoint>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            events: tx,
            local_set: false,
            remote_set: false,
            closed: false,
            connect: self.connect,
            candidate_seq: 0,
        };
        Ok((Box::new(peer), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn controller() -> PeerConnectionController {
        PeerConnectionController::new(Arc::new(LoopbackPeerFactory::default()))
    }

    #[test]
    fn endpoints_are_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Box<dyn PeerEndpoint>>();
        assert_send_sync::<PeerConnectionController>();
    }

    #[tokio::test]
    async fn double_close_is_noop() {
        let mut ctrl = controller();
        ctrl.create(&[]).await.unwrap();
        assert!(ctrl.is_open());

        ctrl.close().await;
        assert!(!ctrl.is_open());
        ctrl.close().await; // second close must not panic or error
    }

    #[tokio::test]
    async fn media_attaches_exactly_once_per_endpoint() {
        let mut ctrl = controller();
        ctrl.create(&[]).await.unwrap();

        let source = StaticMedia::default().acquire().unwrap();
        ctrl.attach_local_media(&source).await.unwrap();
        let err = ctrl.attach_local_media(&source).await.unwrap_err();
        assert!(matches!(err, PeerError::MediaAlreadyAttached));

        // a fresh endpoint accepts media again
        ctrl.create(&[]).await.unwrap();
        ctrl.attach_local_media(&source).await.unwrap();
    }

    #[tokio::test]
    async fn create_closes_prior_endpoint() {
        let mut ctrl = controller();
        let mut first_events = ctrl.create(&[]).await.unwrap();
        let _second_events = ctrl.create(&[]).await.unwrap();

        // the first endpoint observed its own close
        let mut saw_closed = false;
        while let Ok(event) = first_events.try_recv() {
            if matches!(
                event,
                PeerEvent::ConnectionState(PeerConnectionState::Closed)
            ) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn negotiation_errors_without_connection() {
        let mut ctrl = controller();
        assert!(matches!(
            ctrl.create_offer().await.unwrap_err(),
            PeerError::NoConnection
        ));
        assert!(matches!(
            ctrl.add_ice_candidate(IceCandidate {
                candidate: "candidate:1".to_string()
            })
            .await
            .unwrap_err(),
            PeerError::NoConnection
        ));
    }

    #[tokio::test]
    async fn loopback_connects_after_both_descriptions() {
        let factory = LoopbackPeerFactory::default();
        let (mut offerer, mut offerer_events) = factory.create(&[]).unwrap();
        let (mut answerer, mut answerer_events) = factory.create(&[]).unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let connected = |events: &mut mpsc::UnboundedReceiver<PeerEvent>| {
            let mut yes = false;
            while let Ok(event) = events.try_recv() {
                if matches!(
                    event,
                    PeerEvent::ConnectionState(PeerConnectionState::Connected)
                ) {
                    yes = true;
                }
            }
            yes
        };
        assert!(connected(&mut offerer_events));
        assert!(connected(&mut answerer_events));
    }
}
