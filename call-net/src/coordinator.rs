//! Session lifecycle orchestration.
//!
//! One coordinator task per local user drives queueing, pairing, negotiation
//! and teardown. Every input (relay notifications, peer events, timers,
//! commands) funnels into a single event loop; relay-driven events carry the
//! epoch they were subscribed under, and teardown bumps the epoch, so events
//! from a dead session can never touch the next one.

use std::sync::Arc;
use std::time::Duration;

use relay::{CollectionSubscription, Filter, RecordSubscription, RelayRecord, RelayStore,
    SubscriptionGuard};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::matchmaking::{MatchError, MatchmakingQueue};
use crate::metrics;
use crate::peer::{
    MediaSource, MediaSourceProvider, PeerConnectionController, PeerConnectionState, PeerError,
    PeerEvent, PeerFactory,
};
use crate::schema::{self, CallRecord, ChatMessageRecord, QueueTicket, SchemaError, UserRecord};
use crate::shutdown::{self, ShutdownReceiver};
use crate::signaling::{CallRole, NegotiationState, SignalError, SignalingChannel};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Relay(#[from] relay::RelayError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Queued,
    Paired,
    Negotiating,
    Connected,
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub partner_id: Option<String>,
    pub call_id: Option<String>,
    pub last_error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            partner_id: None,
            call_id: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    pub offer_timeout: Duration,
    pub requeue_on_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            offer_timeout: Duration::from_secs(20),
            requeue_on_failure: false,
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    JoinQueue,
    Leave,
    SendMessage(String),
}

enum SessionEvent {
    QueueChanged(Vec<RelayRecord>),
    OwnUser(Option<RelayRecord>),
    PartnerUser(Option<RelayRecord>),
    Call(Option<RelayRecord>),
    Candidates(Vec<RelayRecord>),
    Chat(Vec<RelayRecord>),
    Peer(PeerEvent),
    OfferDeadline { call_id: String },
}

struct Envelope {
    epoch: u64,
    event: SessionEvent,
}

/// Cheap clonable handle over a running coordinator.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionSnapshot>,
    messages: watch::Receiver<Vec<ChatMessageRecord>>,
}

impl SessionHandle {
    pub fn join_queue(&self) {
        let _ = self.commands.send(SessionCommand::JoinQueue);
    }

    pub fn leave(&self) {
        let _ = self.commands.send(SessionCommand::Leave);
    }

    pub fn send_message(&self, text: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::SendMessage(text.into()));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().state
    }

    pub fn messages(&self) -> Vec<ChatMessageRecord> {
        self.messages.borrow().clone()
    }

    /// Blocks until the session reaches `target`. Returns `false` when the
    /// coordinator went away first.
    pub async fn wait_for(&mut self, target: SessionState) -> bool {
        loop {
            if self.state.borrow().state == target {
                return true;
            }
            if self.state.changed().await.is_err() {
                return false;
            }
        }
    }
}

pub struct SessionCoordinator {
    relay: Arc<dyn RelayStore>,
    user_id: String,
    config: SessionConfig,
    media: Arc<dyn MediaSourceProvider>,
    matchmaking: MatchmakingQueue,
    controller: PeerConnectionController,
    signaling: Option<SignalingChannel>,
    local_media: Option<MediaSource>,
    epoch: u64,
    call_seen: bool,
    subscriptions: Vec<SubscriptionGuard>,
    events_tx: mpsc::UnboundedSender<Envelope>,
    events_rx: mpsc::UnboundedReceiver<Envelope>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    state_tx: watch::Sender<SessionSnapshot>,
    messages_tx: watch::Sender<Vec<ChatMessageRecord>>,
    shutdown_rx: ShutdownReceiver,
}

impl SessionCoordinator {
    /// Spawns the coordinator task for one local user.
    pub fn spawn(
        relay: Arc<dyn RelayStore>,
        user_id: String,
        config: SessionConfig,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaSourceProvider>,
        shutdown_rx: ShutdownReceiver,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (messages_tx, messages_rx) = watch::channel(Vec::new());

        let coordinator = Self {
            matchmaking: MatchmakingQueue::new(relay.clone(), user_id.clone()),
            controller: PeerConnectionController::new(peers),
            relay,
            user_id,
            config,
            media,
            signaling: None,
            local_media: None,
            epoch: 0,
            call_seen: false,
            subscriptions: Vec::new(),
            events_tx,
            events_rx,
            commands_rx,
            state_tx,
            messages_tx,
            shutdown_rx,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            state: state_rx,
            messages: messages_rx,
        };
        let task = tokio::spawn(coordinator.run());
        (handle, task)
    }

    async fn run(mut self) {
        let stats = metrics::session_metrics();
        stats.active_sessions.inc();
        info!(user_id = %self.user_id, "session coordinator started");
        loop {
            tokio::select! {
                _ = shutdown::wait(self.shutdown_rx.clone()) => {
                    self.end_session("shutdown").await;
                    break;
                }
                command = self.commands_rx.recv() => {
                    match command {
                        Some(SessionCommand::JoinQueue) => {
                            if let Err(err) = self.handle_join_queue().await {
                                warn!(%err, user_id = %self.user_id, "failed to join queue");
                                self.update(|s| s.last_error = Some(err.to_string()));
                            }
                        }
                        Some(SessionCommand::Leave) => self.end_session("left by user").await,
                        Some(SessionCommand::SendMessage(text)) => {
                            if let Err(err) = self.handle_send_message(text).await {
                                warn!(%err, "failed to send chat message");
                            }
                        }
                        None => {
                            self.end_session("handle dropped").await;
                            break;
                        }
                    }
                }
                Some(envelope) = self.events_rx.recv() => {
                    if envelope.epoch != self.epoch {
                        continue;
                    }
                    if let Err(err) = self.dispatch(envelope.event).await {
                        warn!(%err, user_id = %self.user_id, "event handling failed");
                        self.update(|s| s.last_error = Some(err.to_string()));
                    }
                }
            }
        }
        stats.active_sessions.dec();
        info!(user_id = %self.user_id, "session coordinator stopped");
    }

    async fn dispatch(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::QueueChanged(records) => self.on_queue_changed(records).await,
            SessionEvent::OwnUser(record) => self.on_own_user(record).await,
            SessionEvent::PartnerUser(record) => self.on_partner_user(record).await,
            SessionEvent::Call(record) => self.on_call(record).await,
            SessionEvent::Candidates(records) => self.on_candidates(records).await,
            SessionEvent::Chat(records) => {
                self.on_chat(records);
                Ok(())
            }
            SessionEvent::Peer(event) => self.on_peer(event).await,
            SessionEvent::OfferDeadline { call_id } => {
                self.on_offer_deadline(call_id).await;
                Ok(())
            }
        }
    }

    async fn handle_join_queue(&mut self) -> Result<(), SessionError> {
        let snap = self.snapshot();
        if !matches!(snap.state, SessionState::Idle | SessionState::Ended) {
            warn!(state = ?snap.state, "join ignored, session already active");
            return Ok(());
        }
        let source = match self.media.acquire() {
            Ok(source) => source,
            Err(err) => {
                warn!(%err, user_id = %self.user_id, "media unavailable, staying idle");
                self.update(|s| s.last_error = Some(err.to_string()));
                return Ok(());
            }
        };
        self.local_media = Some(source);
        self.matchmaking.enqueue().await?;

        let queue = self
            .relay
            .subscribe_collection(schema::QUEUE, Filter::All)
            .await?;
        self.forward_collection(queue, SessionEvent::QueueChanged);
        let own = self
            .relay
            .subscribe_record(schema::USERS, &self.user_id)
            .await?;
        self.forward_record(own, SessionEvent::OwnUser);

        self.call_seen = false;
        metrics::session_metrics().sessions_started_total.inc();
        self.update(|s| {
            s.state = SessionState::Queued;
            s.partner_id = None;
            s.call_id = None;
            s.last_error = None;
        });
        Ok(())
    }

    async fn on_queue_changed(&mut self, records: Vec<RelayRecord>) -> Result<(), SessionError> {
        if self.snapshot().state != SessionState::Queued {
            return Ok(());
        }
        let mut tickets = Vec::with_capacity(records.len());
        for record in &records {
            match QueueTicket::from_record(record) {
                Ok(ticket) => tickets.push(ticket),
                Err(err) => warn!(%err, "skipping malformed queue ticket"),
            }
        }
        metrics::session_metrics()
            .queue_depth
            .set(tickets.len() as i64);
        if let Some(pairing) = self.matchmaking.on_queue_change(&tickets).await? {
            self.become_paired(pairing.partner_id).await?;
        }
        Ok(())
    }

    async fn become_paired(&mut self, partner_id: String) -> Result<(), SessionError> {
        let snap = self.snapshot();
        if matches!(
            snap.state,
            SessionState::Paired | SessionState::Negotiating | SessionState::Connected
        ) {
            if snap.partner_id.as_deref() != Some(partner_id.as_str()) {
                warn!(
                    %partner_id,
                    current = ?snap.partner_id,
                    "pairing notification for a different partner ignored"
                );
            }
            return Ok(());
        }

        let call_id = schema::call_id(&self.user_id, &partner_id);
        info!(user_id = %self.user_id, %partner_id, %call_id, "paired");

        let call = self.relay.subscribe_record(schema::CALLS, &call_id).await?;
        self.forward_record(call, SessionEvent::Call);
        let candidates = self
            .relay
            .subscribe_collection(
                schema::CANDIDATES,
                Filter::field_eq("call_id", call_id.clone()),
            )
            .await?;
        self.forward_collection(candidates, SessionEvent::Candidates);
        let chat = self
            .relay
            .subscribe_collection(
                schema::CHAT_MESSAGES,
                Filter::field_eq("call_id", call_id.clone()),
            )
            .await?;
        self.forward_collection(chat, SessionEvent::Chat);
        let partner = self
            .relay
            .subscribe_record(schema::USERS, &partner_id)
            .await?;
        self.forward_record(partner, SessionEvent::PartnerUser);

        let peer_events = self.controller.create(&self.config.ice_servers).await?;
        self.forward_peer(peer_events);
        if let Some(source) = self.local_media.clone() {
            self.controller.attach_local_media(&source).await?;
        }

        let role = if schema::is_offerer(&self.user_id, &partner_id) {
            CallRole::Offerer
        } else {
            CallRole::Answerer
        };
        self.signaling = Some(SignalingChannel::new(
            self.relay.clone(),
            call_id.clone(),
            self.user_id.clone(),
            role,
        ));
        self.call_seen = false;
        metrics::session_metrics().pairings_total.inc();
        self.update(|s| {
            s.state = SessionState::Paired;
            s.partner_id = Some(partner_id.clone());
            s.call_id = Some(call_id.clone());
        });

        if role == CallRole::Offerer {
            // a publish failure must not strand the session in Paired with
            // no timer running; fail it so the retry policy applies
            if let Some(signaling) = self.signaling.as_mut() {
                if let Err(err) = signaling.start_as_offerer(&mut self.controller).await {
                    warn!(%err, %call_id, "offer publish failed");
                    self.fail_session("offer publish failed").await;
                    return Ok(());
                }
            }
            let tx = self.events_tx.clone();
            let epoch = self.epoch;
            let deadline = self.config.offer_timeout;
            let deadline_call = call_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = tx.send(Envelope {
                    epoch,
                    event: SessionEvent::OfferDeadline {
                        call_id: deadline_call,
                    },
                });
            });
        }
        self.update(|s| s.state = SessionState::Negotiating);
        Ok(())
    }

    async fn on_own_user(&mut self, record: Option<RelayRecord>) -> Result<(), SessionError> {
        let snap = self.snapshot();
        let Some(record) = record else {
            if matches!(
                snap.state,
                SessionState::Paired | SessionState::Negotiating | SessionState::Connected
            ) {
                self.fail_session("own user record deleted").await;
            }
            return Ok(());
        };
        let user = UserRecord::from_record(&record)?;
        match snap.state {
            SessionState::Queued => {
                if let Some(partner) = user.partner_id {
                    self.become_paired(partner).await?;
                }
                Ok(())
            }
            SessionState::Paired | SessionState::Negotiating | SessionState::Connected => {
                // a notification queued before the pairing can still deliver
                // the pre-pairing value; only a fresh read decides
                if user.partner_id != snap.partner_id
                    && self.own_partner_lost(&snap.partner_id).await?
                {
                    self.fail_session("pairing dissolved").await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn own_partner_lost(&self, expected: &Option<String>) -> Result<bool, SessionError> {
        match self.relay.get(schema::USERS, &self.user_id).await? {
            Some(record) => Ok(UserRecord::from_record(&record)?.partner_id != *expected),
            None => Ok(true),
        }
    }

    async fn on_partner_user(&mut self, record: Option<RelayRecord>) -> Result<(), SessionError> {
        let snap = self.snapshot();
        if !matches!(
            snap.state,
            SessionState::Paired | SessionState::Negotiating | SessionState::Connected
        ) {
            return Ok(());
        }
        let points_back = match &record {
            Some(record) => {
                let partner = UserRecord::from_record(record)?;
                partner.partner_id.as_deref() == Some(self.user_id.as_str())
            }
            None => false,
        };
        if points_back {
            return Ok(());
        }
        // the delivered value may predate the partner's own pairing write;
        // confirm against the store before giving up
        let Some(partner_id) = snap.partner_id.as_deref() else {
            return Ok(());
        };
        let still_gone = match self.relay.get(schema::USERS, partner_id).await? {
            Some(record) => {
                UserRecord::from_record(&record)?.partner_id.as_deref()
                    != Some(self.user_id.as_str())
            }
            None => true,
        };
        if still_gone {
            self.fail_session("partner left the call").await;
        }
        Ok(())
    }

    async fn on_call(&mut self, record: Option<RelayRecord>) -> Result<(), SessionError> {
        let Some(record) = record else {
            // the initial notification for a not-yet-created call record is
            // also None; only a disappearance after we saw the call matters
            if self.call_seen {
                self.fail_session("call ended by partner").await;
            }
            return Ok(());
        };
        self.call_seen = true;
        let call = CallRecord::from_record(&record)?;
        let Some(signaling) = self.signaling.as_mut() else {
            return Ok(());
        };
        if let Err(err) = signaling.apply_remote(&call, &mut self.controller).await {
            warn!(%err, call_id = %call.call_id, "call record not applied");
        }
        Ok(())
    }

    async fn on_candidates(&mut self, records: Vec<RelayRecord>) -> Result<(), SessionError> {
        let Some(signaling) = self.signaling.as_mut() else {
            return Ok(());
        };
        for record in &records {
            if let Err(err) = signaling.apply_candidate(record, &mut self.controller).await {
                warn!(%err, record_id = %record.id, "candidate not applied");
            }
        }
        Ok(())
    }

    fn on_chat(&mut self, records: Vec<RelayRecord>) {
        let mut messages = Vec::with_capacity(records.len());
        for record in &records {
            match ChatMessageRecord::from_record(record) {
                Ok(message) => messages.push(message),
                Err(err) => warn!(%err, record_id = %record.id, "skipping malformed chat message"),
            }
        }
        messages.sort_by(|a, b| {
            a.sent_at
                .cmp(&b.sent_at)
                .then_with(|| a.sender_id.cmp(&b.sender_id))
        });
        let _ = self.messages_tx.send(messages);
    }

    async fn on_peer(&mut self, event: PeerEvent) -> Result<(), SessionError> {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Some(signaling) = self.signaling.as_ref() {
                    signaling.publish_local(&candidate).await?;
                }
                Ok(())
            }
            PeerEvent::Track(track) => {
                debug!(track_id = %track.id, kind = %track.kind, "remote track arrived");
                Ok(())
            }
            PeerEvent::ConnectionState(state) => {
                match state {
                    PeerConnectionState::Connected => {
                        metrics::session_metrics().calls_connected_total.inc();
                        self.update(|s| {
                            s.state = SessionState::Connected;
                            s.last_error = None;
                        });
                    }
                    PeerConnectionState::Failed => {
                        self.fail_session("peer connection failed").await;
                    }
                    PeerConnectionState::Disconnected => {
                        self.update(|s| s.last_error = Some("peer disconnected".to_string()));
                    }
                    _ => {}
                }
                Ok(())
            }
        }
    }

    async fn on_offer_deadline(&mut self, call_id: String) {
        let expired = self
            .signaling
            .as_ref()
            .is_some_and(|s| s.call_id() == call_id && s.state() == NegotiationState::HaveLocalOffer);
        if expired {
            self.fail_session("offer timed out").await;
        }
    }

    async fn handle_send_message(&mut self, text: String) -> Result<(), SessionError> {
        let snap = self.snapshot();
        let Some(call_id) = snap.call_id else {
            warn!("chat message dropped, no active call");
            return Ok(());
        };
        let message = ChatMessageRecord {
            call_id,
            sender_id: self.user_id.clone(),
            text,
            sent_at: chrono::Utc::now(),
        };
        self.relay
            .put(
                schema::CHAT_MESSAGES,
                &Uuid::new_v4().to_string(),
                message.to_fields(),
                false,
            )
            .await?;
        Ok(())
    }

    async fn fail_session(&mut self, reason: &str) {
        warn!(user_id = %self.user_id, reason, "session failed");
        self.update(|s| s.last_error = Some(reason.to_string()));
        self.end_session(reason).await;
        if self.config.requeue_on_failure {
            if let Err(err) = self.handle_join_queue().await {
                warn!(%err, user_id = %self.user_id, "requeue after failure failed");
            }
        }
    }

    /// Full teardown. Safe to call repeatedly; relay cleanup is best effort
    /// and both sides of a pair run it, so deletes race benignly.
    async fn end_session(&mut self, reason: &str) {
        let snap = self.snapshot();
        if matches!(snap.state, SessionState::Idle | SessionState::Ended)
            && self.subscriptions.is_empty()
        {
            return;
        }
        info!(user_id = %self.user_id, reason, "ending session");

        // stale events from this session must not reach the next one
        self.epoch += 1;
        for guard in self.subscriptions.drain(..) {
            guard.unsubscribe();
        }
        self.signaling = None;

        if let Err(err) = self.matchmaking.dequeue().await {
            warn!(%err, "dequeue during teardown failed");
        }
        if let Some(partner_id) = snap.partner_id.as_deref() {
            if let Err(err) = self.matchmaking.unpair(partner_id).await {
                warn!(%err, partner_id, "unpair during teardown failed");
            }
        }
        if let Some(call_id) = snap.call_id.as_deref() {
            if let Err(err) = self.relay.delete(schema::CALLS, call_id).await {
                warn!(%err, call_id, "call record delete failed");
            }
            self.clear_call_collections(call_id).await;
        }

        self.controller.close().await;
        self.local_media = None;
        self.call_seen = false;
        let _ = self.messages_tx.send(Vec::new());
        self.update(|s| {
            s.state = SessionState::Ended;
            s.partner_id = None;
            s.call_id = None;
        });
    }

    async fn clear_call_collections(&self, call_id: &str) {
        for collection in [schema::CANDIDATES, schema::CHAT_MESSAGES] {
            let filter = Filter::field_eq("call_id", call_id.to_string());
            match self.relay.list(collection, &filter).await {
                Ok(records) => {
                    for record in records {
                        if let Err(err) = self.relay.delete(collection, &record.id).await {
                            warn!(%err, collection, record_id = %record.id, "cleanup delete failed");
                        }
                    }
                }
                Err(err) => warn!(%err, collection, "cleanup listing failed"),
            }
        }
    }

    fn forward_collection(
        &mut self,
        sub: CollectionSubscription,
        wrap: fn(Vec<RelayRecord>) -> SessionEvent,
    ) {
        let (mut events, guard) = sub.into_parts();
        self.subscriptions.push(guard);
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(batch) = events.recv().await {
                if tx.send(Envelope { epoch, event: wrap(batch) }).is_err() {
                    break;
                }
            }
        });
    }

    fn forward_record(
        &mut self,
        sub: RecordSubscription,
        wrap: fn(Option<RelayRecord>) -> SessionEvent,
    ) {
        let (mut events, guard) = sub.into_parts();
        self.subscriptions.push(guard);
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(value) = events.recv().await {
                if tx.send(Envelope { epoch, event: wrap(value) }).is_err() {
                    break;
                }
            }
        });
    }

    fn forward_peer(&mut self, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx
                    .send(Envelope {
                        epoch,
                        event: SessionEvent::Peer(event),
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.state_tx.borrow().clone()
    }

    fn update<F: FnOnce(&mut SessionSnapshot)>(&self, mutate: F) {
        let mut snap = self.state_tx.borrow().clone();
        mutate(&mut snap);
        let _ = self.state_tx.send(snap);
    }
}
