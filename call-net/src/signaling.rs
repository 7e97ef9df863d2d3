//! Offer/answer exchange and candidate trickling over the relay.
//!
//! One call record holds both descriptions; candidates travel as individual
//! records filtered by call id so concurrent writers never clobber each
//! other. Every apply is keyed off observed relay state, so redelivered or
//! reordered notifications collapse into no-ops.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use relay::{RelayRecord, RelayStore};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::peer::{IceCandidate, PeerConnectionController, PeerError};
use crate::schema::{self, CallRecord, CandidateRecord, SchemaError};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("negotiation already in progress for call {0}")]
    AlreadyNegotiating(String),
    #[error("only the offerer publishes the call record")]
    NotOfferer,
    #[error("call record {0} carries no offer yet")]
    MissingOffer(String),
    #[error(transparent)]
    Relay(#[from] relay::RelayError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Offerer,
    Answerer,
}

/// Per-call negotiation driver for one side of the pair.
pub struct SignalingChannel {
    relay: Arc<dyn RelayStore>,
    call_id: String,
    local_id: String,
    role: CallRole,
    state: NegotiationState,
    seen_candidates: HashSet<String>,
    pending_remote: VecDeque<IceCandidate>,
}

impl SignalingChannel {
    pub fn new(
        relay: Arc<dyn RelayStore>,
        call_id: String,
        local_id: String,
        role: CallRole,
    ) -> Self {
        Self {
            relay,
            call_id,
            local_id,
            role,
            state: NegotiationState::Idle,
            seen_candidates: HashSet::new(),
            pending_remote: VecDeque::new(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Creates the local offer and publishes the call record. Offerer side
    /// only, and only from a clean slate.
    pub async fn start_as_offerer(
        &mut self,
        controller: &mut PeerConnectionController,
    ) -> Result<(), SignalError> {
        if self.role != CallRole::Offerer {
            return Err(SignalError::NotOfferer);
        }
        if self.state != NegotiationState::Idle {
            return Err(SignalError::AlreadyNegotiating(self.call_id.clone()));
        }
        let offer = controller.create_offer().await?;
        let record = CallRecord {
            call_id: self.call_id.clone(),
            offerer_id: self.local_id.clone(),
            offer: Some(offer),
            answer: None,
            created_at: Utc::now(),
        };
        self.relay
            .put(schema::CALLS, &self.call_id, record.to_fields(), false)
            .await?;
        self.state = NegotiationState::HaveLocalOffer;
        debug!(call_id = %self.call_id, "offer published");
        Ok(())
    }

    /// Folds a call-record notification into local state. Returns `true`
    /// when the notification advanced negotiation; already-applied or
    /// not-yet-relevant records return `false`.
    pub async fn apply_remote(
        &mut self,
        record: &CallRecord,
        controller: &mut PeerConnectionController,
    ) -> Result<bool, SignalError> {
        if record.call_id != self.call_id {
            warn!(got = %record.call_id, want = %self.call_id, "call record for another call");
            return Ok(false);
        }
        match (self.role, self.state) {
            (CallRole::Answerer, NegotiationState::Idle) => {
                let Some(offer) = record.offer.clone() else {
                    return Err(SignalError::MissingOffer(self.call_id.clone()));
                };
                // the offerer may have torn the call down between the
                // notification and this apply; answering a deleted call
                // would resurrect the record, so abandon instead
                let Some(current) = self.relay.get(schema::CALLS, &self.call_id).await? else {
                    warn!(call_id = %self.call_id, "call gone before answering, abandoned");
                    return Ok(false);
                };
                let answered = CallRecord::from_record(&current)?.answer.is_some();

                controller.set_remote_description(offer).await?;
                self.state = NegotiationState::HaveRemoteOffer;
                self.drain_pending(controller).await?;

                let answer = controller.create_answer().await?;
                // only fill the answer slot if it is still empty; a redelivery
                // racing our own write must not publish a second answer
                if !answered {
                    self.relay
                        .put(
                            schema::CALLS,
                            &self.call_id,
                            serde_json::json!({
                                "answer": serde_json::to_value(&answer)?,
                            }),
                            true,
                        )
                        .await?;
                }
                self.state = NegotiationState::Stable;
                debug!(call_id = %self.call_id, "answer published");
                Ok(true)
            }
            (CallRole::Offerer, NegotiationState::HaveLocalOffer) => {
                let Some(answer) = record.answer.clone() else {
                    // our own offer echoed back before the partner answered
                    return Ok(false);
                };
                controller.set_remote_description(answer).await?;
                self.state = NegotiationState::Stable;
                self.drain_pending(controller).await?;
                debug!(call_id = %self.call_id, "answer applied");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Whether the remote description has been applied, which is when
    /// candidates can go straight to the endpoint.
    fn remote_description_applied(&self) -> bool {
        matches!(
            (self.role, self.state),
            (CallRole::Answerer, NegotiationState::HaveRemoteOffer)
                | (_, NegotiationState::Stable)
        )
    }

    /// Folds a candidate record in: skips our own and duplicates, buffers
    /// candidates that arrive ahead of the remote description.
    pub async fn apply_candidate(
        &mut self,
        record: &RelayRecord,
        controller: &mut PeerConnectionController,
    ) -> Result<(), SignalError> {
        let candidate = CandidateRecord::from_record(record)?;
        if candidate.call_id != self.call_id || candidate.sender_id == self.local_id {
            return Ok(());
        }
        if !self.seen_candidates.insert(record.id.clone()) {
            return Ok(());
        }
        if self.remote_description_applied() {
            controller.add_ice_candidate(candidate.candidate).await?;
        } else {
            self.pending_remote.push_back(candidate.candidate);
        }
        Ok(())
    }

    async fn drain_pending(
        &mut self,
        controller: &mut PeerConnectionController,
    ) -> Result<(), SignalError> {
        while let Some(candidate) = self.pending_remote.pop_front() {
            controller.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Publishes a locally gathered candidate for the partner to pick up.
    pub async fn publish_local(&self, candidate: &IceCandidate) -> Result<(), SignalError> {
        let record = CandidateRecord {
            call_id: self.call_id.clone(),
            sender_id: self.local_id.clone(),
            candidate: candidate.clone(),
            posted_at: Utc::now(),
        };
        self.relay
            .put(
                schema::CANDIDATES,
                &Uuid::new_v4().to_string(),
                record.to_fields(),
                false,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LoopbackPeerFactory;
    use relay::MemoryRelay;

    struct Side {
        channel: SignalingChannel,
        controller: PeerConnectionController,
    }

    async fn side(relay: &MemoryRelay, call_id: &str, local: &str, role: CallRole) -> Side {
        let mut controller =
            PeerConnectionController::new(Arc::new(LoopbackPeerFactory::default()));
        controller.create(&[]).await.unwrap();
        Side {
            channel: SignalingChannel::new(
                Arc::new(relay.clone()),
                call_id.to_string(),
                local.to_string(),
                role,
            ),
            controller,
        }
    }

    async fn call_record(relay: &MemoryRelay, call_id: &str) -> CallRecord {
        let rec = relay.get(schema::CALLS, call_id).await.unwrap().unwrap();
        CallRecord::from_record(&rec).unwrap()
    }

    #[tokio::test]
    async fn offer_then_answer_reaches_stable_on_both_sides() {
        let relay = MemoryRelay::default();
        let call_id = schema::call_id("alice", "bob");
        let mut alice = side(&relay, &call_id, "alice", CallRole::Offerer).await;
        let mut bob = side(&relay, &call_id, "bob", CallRole::Answerer).await;

        alice
            .channel
            .start_as_offerer(&mut alice.controller)
            .await
            .unwrap();
        let with_offer = call_record(&relay, &call_id).await;
        assert!(with_offer.offer.is_some());
        assert!(with_offer.answer.is_none());

        let advanced = bob
            .channel
            .apply_remote(&with_offer, &mut bob.controller)
            .await
            .unwrap();
        assert!(advanced);
        assert_eq!(bob.channel.state(), NegotiationState::Stable);

        let with_answer = call_record(&relay, &call_id).await;
        assert!(with_answer.answer.is_some());
        let advanced = alice
            .channel
            .apply_remote(&with_answer, &mut alice.controller)
            .await
            .unwrap();
        assert!(advanced);
        assert_eq!(alice.channel.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn redelivered_records_are_noops() {
        let relay = MemoryRelay::default();
        let call_id = schema::call_id("alice", "bob");
        let mut alice = side(&relay, &call_id, "alice", CallRole::Offerer).await;
        let mut bob = side(&relay, &call_id, "bob", CallRole::Answerer).await;

        alice
            .channel
            .start_as_offerer(&mut alice.controller)
            .await
            .unwrap();
        let with_offer = call_record(&relay, &call_id).await;
        bob.channel
            .apply_remote(&with_offer, &mut bob.controller)
            .await
            .unwrap();
        let answered = call_record(&relay, &call_id).await;
        let first_answer = answered.answer.clone().unwrap();

        // deliver the same offer twice more: no state change, answer untouched
        for _ in 0..2 {
            let advanced = bob
                .channel
                .apply_remote(&with_offer, &mut bob.controller)
                .await
                .unwrap();
            assert!(!advanced);
        }
        assert_eq!(
            call_record(&relay, &call_id).await.answer.unwrap(),
            first_answer
        );

        alice
            .channel
            .apply_remote(&answered, &mut alice.controller)
            .await
            .unwrap();
        let advanced = alice
            .channel
            .apply_remote(&answered, &mut alice.controller)
            .await
            .unwrap();
        assert!(!advanced);
    }

    #[tokio::test]
    async fn deleted_call_is_not_resurrected_by_a_late_answer() {
        let relay = MemoryRelay::default();
        let call_id = schema::call_id("alice", "bob");
        let mut alice = side(&relay, &call_id, "alice", CallRole::Offerer).await;
        let mut bob = side(&relay, &call_id, "bob", CallRole::Answerer).await;

        alice
            .channel
            .start_as_offerer(&mut alice.controller)
            .await
            .unwrap();
        let with_offer = call_record(&relay, &call_id).await;

        // alice hangs up before bob processes the offer notification
        relay.delete(schema::CALLS, &call_id).await.unwrap();

        let advanced = bob
            .channel
            .apply_remote(&with_offer, &mut bob.controller)
            .await
            .unwrap();
        assert!(!advanced);
        assert_eq!(bob.channel.state(), NegotiationState::Idle);
        assert!(relay.get(schema::CALLS, &call_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offerer_ignores_record_without_answer() {
        let relay = MemoryRelay::default();
        let call_id = schema::call_id("alice", "bob");
        let mut alice = side(&relay, &call_id, "alice", CallRole::Offerer).await;

        alice
            .channel
            .start_as_offerer(&mut alice.controller)
            .await
            .unwrap();
        let echo = call_record(&relay, &call_id).await;
        let advanced = alice
            .channel
            .apply_remote(&echo, &mut alice.controller)
            .await
            .unwrap();
        assert!(!advanced);
        assert_eq!(alice.channel.state(), NegotiationState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn early_candidates_buffer_until_remote_description() {
        let relay = MemoryRelay::default();
        let call_id = schema::call_id("alice", "bob");
        let mut alice = side(&relay, &call_id, "alice", CallRole::Offerer).await;
        let mut bob = side(&relay, &call_id, "bob", CallRole::Answerer).await;

        // bob hears alice's candidate before her offer
        alice
            .channel
            .publish_local(&IceCandidate {
                candidate: "candidate:early 1 udp 1 127.0.0.1 9000 typ host".to_string(),
            })
            .await
            .unwrap();
        let candidates = relay.list(schema::CANDIDATES, &relay::Filter::All).await.unwrap();
        for record in &candidates {
            bob.channel
                .apply_candidate(record, &mut bob.controller)
                .await
                .unwrap();
        }
        assert_eq!(bob.channel.pending_remote.len(), 1);

        alice
            .channel
            .start_as_offerer(&mut alice.controller)
            .await
            .unwrap();
        let with_offer = call_record(&relay, &call_id).await;
        bob.channel
            .apply_remote(&with_offer, &mut bob.controller)
            .await
            .unwrap();
        assert!(bob.channel.pending_remote.is_empty());
    }

    #[tokio::test]
    async fn own_and_duplicate_candidates_are_skipped() {
        let relay = MemoryRelay::default();
        let call_id = schema::call_id("alice", "bob");
        let mut alice = side(&relay, &call_id, "alice", CallRole::Offerer).await;

        alice
            .channel
            .publish_local(&IceCandidate {
                candidate: "candidate:self 1 udp 1 127.0.0.1 9000 typ host".to_string(),
            })
            .await
            .unwrap();
        let candidates = relay.list(schema::CANDIDATES, &relay::Filter::All).await.unwrap();
        for record in &candidates {
            // own candidate: neither buffered nor applied
            alice
                .channel
                .apply_candidate(record, &mut alice.controller)
                .await
                .unwrap();
        }
        assert!(alice.channel.pending_remote.is_empty());
        assert!(alice.channel.seen_candidates.is_empty());
    }

    #[tokio::test]
    async fn second_start_as_offerer_is_rejected() {
        let relay = MemoryRelay::default();
        let call_id = schema::call_id("alice", "bob");
        let mut alice = side(&relay, &call_id, "alice", CallRole::Offerer).await;
        let mut bob = side(&relay, &call_id, "bob", CallRole::Answerer).await;

        alice
            .channel
            .start_as_offerer(&mut alice.controller)
            .await
            .unwrap();
        assert!(matches!(
            alice
                .channel
                .start_as_offerer(&mut alice.controller)
                .await
                .unwrap_err(),
            SignalError::AlreadyNegotiating(_)
        ));
        assert!(matches!(
            bob.channel
                .start_as_offerer(&mut bob.controller)
                .await
                .unwrap_err(),
            SignalError::NotOfferer
        ));
    }
}
