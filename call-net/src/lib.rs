//! Core library for anonymous 1:1 call rendezvous: matchmaking over a shared
//! relay, offer/answer/candidate signaling, peer connection lifecycle and the
//! session coordinator tying them together.

pub mod coordinator;
pub mod matchmaking;
pub mod metrics;
pub mod peer;
pub mod schema;
pub mod shutdown;
pub mod signaling;
pub mod telemetry;

pub use coordinator::{
    SessionConfig, SessionCoordinator, SessionHandle, SessionSnapshot, SessionState,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
