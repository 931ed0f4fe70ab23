//! `Connection` - per-remote-peer negotiation state machine.
//!
//! Each `Connection`:
//! - Owns exactly one transport to one remote peer
//! - Drives the offer/answer exchange through the room's [`PairChannel`]
//! - Trickles local candidates and applies remote ones in order
//!
//! Connections are not actors of their own. They are owned by the
//! coordinator's session table and mutated only from the coordinator task,
//! so all state transitions are serialized with the rest of the session.
//!
//! # Lifecycle
//!
//! ```text
//! Created ─┬─ initiator ─► OfferSent ──────┬─► DescriptionExchanged ─► Connected
//!          └─ responder ─► OfferReceived ──┘
//!                        (any state) ─► Closed
//! ```

use crate::errors::MeshError;
use crate::observability::metrics;
use crate::pair_channel::{CandidateRecord, DescriptionRecord, PairChannel, PairKey};
use crate::store::Subscription;
use crate::transport::{
    IceCandidate, PeerTransport, SdpType, TransportEvent, TransportEventSink, TransportState,
};

use super::messages::{
    ConnectionEvent, ConnectionInfo, ConnectionState, Role, SessionEvent, SessionEventKind,
    TeardownReason,
};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Posts events for one connection onto the session queue.
#[derive(Clone, Debug)]
pub struct ConnectionEventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
    generation: u64,
    peer_id: String,
    epoch: u64,
}

impl ConnectionEventSender {
    #[must_use]
    pub fn new(
        tx: mpsc::UnboundedSender<SessionEvent>,
        generation: u64,
        peer_id: impl Into<String>,
        epoch: u64,
    ) -> Self {
        Self {
            tx,
            generation,
            peer_id: peer_id.into(),
            epoch,
        }
    }

    /// Enqueue an event. A closed queue means the coordinator is gone.
    pub fn send(&self, event: ConnectionEvent) {
        let _ = self.tx.send(SessionEvent {
            generation: self.generation,
            kind: SessionEventKind::Connection {
                peer_id: self.peer_id.clone(),
                epoch: self.epoch,
                event,
            },
        });
    }

    /// Sink handed to the transport factory.
    #[must_use]
    pub fn transport_sink(&self) -> TransportEventSink {
        let sender = self.clone();
        Arc::new(move |event| sender.send(ConnectionEvent::Transport(event)))
    }
}

/// What a transport state change means for the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOutcome {
    /// The connection just reached connected.
    Connected,
    /// The connection is lost and must be torn down.
    Lost,
    /// Nothing for the session to do.
    Unchanged,
}

/// One peer-to-peer connection.
pub struct Connection {
    local_peer_id: String,
    remote_peer_id: String,
    pair_key: PairKey,
    role: Role,
    epoch: u64,
    state: ConnectionState,
    transport: Arc<dyn PeerTransport>,
    channel: PairChannel,
    events: ConnectionEventSender,
    answer_subscription: Option<Subscription>,
    candidate_subscription: Option<Subscription>,
    /// Remote candidates received before the remote description was applied.
    pending_remote_candidates: Vec<IceCandidate>,
    remote_description_applied: bool,
    /// `createdAt` of the offer a responder answered.
    answered_offer_at: Option<i64>,
    /// `createdAt` of the offer an initiator published.
    published_offer_at: Option<i64>,
    candidates_cleared: bool,
    closing: bool,
}

impl Connection {
    /// Wrap a freshly created transport. Negotiation starts with
    /// [`Connection::start_as_initiator`] or [`Connection::start_as_responder`].
    #[must_use]
    pub fn new(
        local_peer_id: &str,
        remote_peer_id: &str,
        role: Role,
        epoch: u64,
        transport: Arc<dyn PeerTransport>,
        channel: PairChannel,
        events: ConnectionEventSender,
    ) -> Self {
        let pair_key = match role {
            Role::Initiator => PairKey::new(local_peer_id, remote_peer_id),
            Role::Responder => PairKey::new(remote_peer_id, local_peer_id),
        };

        metrics::record_connection_started(role.as_str());

        Self {
            local_peer_id: local_peer_id.to_string(),
            remote_peer_id: remote_peer_id.to_string(),
            pair_key,
            role,
            epoch,
            state: ConnectionState::Created,
            transport,
            channel,
            events,
            answer_subscription: None,
            candidate_subscription: None,
            pending_remote_candidates: Vec::new(),
            remote_description_applied: false,
            answered_offer_at: None,
            published_offer_at: None,
            candidates_cleared: false,
            closing: false,
        }
    }

    #[must_use]
    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    #[must_use]
    pub fn pair_key(&self) -> &PairKey {
        &self.pair_key
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether this responder already answered `offer`.
    /// `createdAt` of the offer published by an initiator, once sent.
    #[must_use]
    pub fn published_offer_at(&self) -> Option<i64> {
        self.published_offer_at
    }

    #[must_use]
    pub fn has_answered(&self, offer: &DescriptionRecord) -> bool {
        self.role == Role::Responder && self.answered_offer_at == Some(offer.created_at)
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: self.remote_peer_id.clone(),
            pair_key: self.pair_key.to_string(),
            role: self.role,
            state: self.state,
        }
    }

    /// Publish an offer and wait for the matching answer.
    pub async fn start_as_initiator(&mut self) -> Result<(), MeshError> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;

        let record = DescriptionRecord::new(&self.local_peer_id, &self.remote_peer_id, offer);
        self.channel.publish_offer(&self.pair_key, &record).await?;
        self.published_offer_at = Some(record.created_at);
        self.state = ConnectionState::OfferSent;

        let answers = self.events.clone();
        self.answer_subscription = Some(
            self.channel
                .subscribe_answer(&self.pair_key, move |answer| {
                    answers.send(ConnectionEvent::Answer(answer));
                })
                .await?,
        );
        self.subscribe_remote_candidates().await?;

        debug!(
            target: "mesh.actor.connection",
            peer_id = %self.remote_peer_id,
            pair_key = %self.pair_key,
            "Offer published"
        );
        Ok(())
    }

    /// Answer an inbound offer and consume it.
    pub async fn start_as_responder(&mut self, offer: DescriptionRecord) -> Result<(), MeshError> {
        let offer_created_at = offer.created_at;
        self.answered_offer_at = Some(offer_created_at);
        self.transport
            .set_remote_description(offer.description)
            .await?;
        self.remote_description_applied = true;
        self.state = ConnectionState::OfferReceived;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;

        let record = DescriptionRecord::new(&self.local_peer_id, &self.remote_peer_id, answer)
            .answering(offer_created_at);
        self.channel.publish_answer(&self.pair_key, &record).await?;
        self.state = ConnectionState::DescriptionExchanged;

        self.channel.clear_offer(&self.pair_key).await;
        self.subscribe_remote_candidates().await?;

        debug!(
            target: "mesh.actor.connection",
            peer_id = %self.remote_peer_id,
            pair_key = %self.pair_key,
            "Answer published"
        );
        Ok(())
    }

    async fn subscribe_remote_candidates(&mut self) -> Result<(), MeshError> {
        let candidates = self.events.clone();
        self.candidate_subscription = Some(
            self.channel
                .subscribe_candidates(
                    &self.pair_key,
                    self.role.candidate_role().opposite(),
                    move |record| candidates.send(ConnectionEvent::RemoteCandidate(record)),
                )
                .await?,
        );
        Ok(())
    }

    /// Apply the first answer to the offer this connection published.
    ///
    /// Later answers, and answers left over from an earlier offer under the
    /// same pair key, are ignored and left in place.
    pub async fn handle_answer(&mut self, record: DescriptionRecord) -> Result<(), MeshError> {
        let expected = self.role == Role::Initiator
            && !self.remote_description_applied
            && record.from == self.remote_peer_id
            && record.to == self.local_peer_id
            && record.description.sdp_type == SdpType::Answer
            && self
                .published_offer_at
                .is_some_and(|offer_at| record.answers_offer(offer_at));
        if self.closing || !expected {
            debug!(
                target: "mesh.actor.connection",
                peer_id = %self.remote_peer_id,
                pair_key = %self.pair_key,
                "Ignoring answer without matching in-flight offer"
            );
            return Ok(());
        }

        self.transport
            .set_remote_description(record.description)
            .await?;
        self.remote_description_applied = true;
        self.state = ConnectionState::DescriptionExchanged;

        if let Some(subscription) = self.answer_subscription.take() {
            subscription.unsubscribe();
        }
        self.channel.clear_answer(&self.pair_key).await;
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Apply or buffer a remote candidate. Rejections are never fatal.
    pub async fn handle_remote_candidate(&mut self, record: CandidateRecord) {
        if self.closing {
            return;
        }
        if record.owner != self.remote_peer_id {
            debug!(
                target: "mesh.actor.connection",
                peer_id = %self.remote_peer_id,
                owner = %record.owner,
                "Ignoring candidate from unexpected owner"
            );
            return;
        }

        if self.remote_description_applied {
            self.apply_remote_candidate(record.candidate).await;
        } else {
            self.pending_remote_candidates.push(record.candidate);
        }
    }

    async fn flush_pending_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_remote_candidates) {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_remote_candidate(candidate).await {
            warn!(
                target: "mesh.actor.connection",
                peer_id = %self.remote_peer_id,
                pair_key = %self.pair_key,
                error = %e,
                "Remote candidate rejected"
            );
            metrics::record_candidate_rejected();
        }
    }

    /// Trickle a local candidate unless the lists are no longer needed.
    pub async fn handle_local_candidate(&mut self, candidate: IceCandidate) -> Result<(), MeshError> {
        if self.closing || self.state == ConnectionState::Connected || self.candidates_cleared {
            return Ok(());
        }

        self.channel
            .publish_candidate(
                &self.pair_key,
                self.role.candidate_role(),
                &self.local_peer_id,
                candidate,
            )
            .await?;
        Ok(())
    }

    /// React to a transport state transition.
    pub async fn handle_state_change(&mut self, state: TransportState) -> StateOutcome {
        if self.closing {
            return StateOutcome::Unchanged;
        }

        if state.is_terminal() {
            return StateOutcome::Lost;
        }

        if !state.is_connected() {
            return StateOutcome::Unchanged;
        }

        if !self.candidates_cleared {
            self.candidates_cleared = true;
            self.channel.clear_candidates(&self.pair_key).await;
        }

        if self.state == ConnectionState::Connected {
            return StateOutcome::Unchanged;
        }

        self.state = ConnectionState::Connected;
        metrics::record_connection_established(self.role.as_str());
        info!(
            target: "mesh.actor.connection",
            peer_id = %self.remote_peer_id,
            pair_key = %self.pair_key,
            role = %self.role,
            "Connection established"
        );
        StateOutcome::Connected
    }

    /// Forward a transport event, returning the state outcome for state changes.
    pub async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<StateOutcome, MeshError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.handle_local_candidate(candidate).await?;
                Ok(StateOutcome::Unchanged)
            }
            TransportEvent::StateChanged(state) => Ok(self.handle_state_change(state).await),
            TransportEvent::RemoteStreamAdded => Ok(StateOutcome::Unchanged),
        }
    }

    /// Release everything this connection holds.
    ///
    /// Idempotent: returns `false` without side effects if teardown already
    /// ran. Every step is best-effort.
    pub async fn teardown(&mut self, reason: TeardownReason) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;

        if let Some(subscription) = self.answer_subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(subscription) = self.candidate_subscription.take() {
            subscription.unsubscribe();
        }
        self.pending_remote_candidates.clear();

        if let Err(e) = self.transport.close().await {
            debug!(
                target: "mesh.actor.connection",
                peer_id = %self.remote_peer_id,
                error = %e,
                "Transport close failed"
            );
            metrics::record_cleanup_failure("close_transport");
        }

        self.channel.clear_candidates(&self.pair_key).await;
        match self.role {
            Role::Initiator => self.channel.clear_offer(&self.pair_key).await,
            Role::Responder => self.channel.clear_answer(&self.pair_key).await,
        }

        self.state = ConnectionState::Closed;
        metrics::record_teardown(reason.as_str());
        info!(
            target: "mesh.actor.connection",
            peer_id = %self.remote_peer_id,
            pair_key = %self.pair_key,
            reason = %reason,
            "Connection torn down"
        );
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{
        DeferredMutation, Listener, SignalingStore, StoreError, TransactionFn, TransactionOutcome,
    };
    use crate::transport::{SessionDescription, TransportError};
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Store that accepts everything and records deletes.
    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
        appends: Mutex<Vec<String>>,
        subscriptions: AtomicUsize,
        unsubscriptions: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SignalingStore for RecordingStore {
        async fn read(&self, _path: &str) -> Result<Option<Value>, StoreError> {
            Ok(None)
        }

        async fn write(&self, path: &str, _value: Value) -> Result<(), StoreError> {
            self.writes.lock().unwrap().push(path.to_string());
            Ok(())
        }

        async fn update(&self, _path: &str, _fields: Map<String, Value>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete(&self, path: &str) -> Result<(), StoreError> {
            self.deletes.lock().unwrap().push(path.to_string());
            Ok(())
        }

        async fn transact(
            &self,
            _path: &str,
            mut apply: TransactionFn,
        ) -> Result<TransactionOutcome, StoreError> {
            match apply(None) {
                crate::store::TransactionDecision::Commit(value) => Ok(TransactionOutcome {
                    committed: true,
                    value,
                }),
                crate::store::TransactionDecision::Abort => Ok(TransactionOutcome {
                    committed: false,
                    value: None,
                }),
            }
        }

        async fn append_unique(&self, path: &str, _value: Value) -> Result<String, StoreError> {
            let mut appends = self.appends.lock().unwrap();
            appends.push(path.to_string());
            Ok(format!("{:020}", appends.len()))
        }

        async fn on_value_changed(
            &self,
            path: &str,
            _listener: Listener,
        ) -> Result<Subscription, StoreError> {
            self.subscribe(path)
        }

        async fn on_child_appended(
            &self,
            path: &str,
            _listener: Listener,
        ) -> Result<Subscription, StoreError> {
            self.subscribe(path)
        }

        async fn defer_on_disconnect(
            &self,
            _path: &str,
            _mutation: DeferredMutation,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn cancel_deferred(&self, _path: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    impl RecordingStore {
        fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            let unsubscriptions = Arc::clone(&self.unsubscriptions);
            Ok(Subscription::new(path, move || {
                unsubscriptions.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    /// Transport that succeeds and counts calls.
    #[derive(Default)]
    struct CountingTransport {
        closes: AtomicUsize,
        remote_descriptions: AtomicUsize,
        remote_candidates: Mutex<Vec<String>>,
        reject_candidates: bool,
    }

    #[async_trait::async_trait]
    impl PeerTransport for CountingTransport {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn set_remote_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), TransportError> {
            self.remote_descriptions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
            if self.reject_candidates {
                return Err(TransportError::Candidate(candidate.candidate));
            }
            self.remote_candidates.lock().unwrap().push(candidate.candidate);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connection(
        role: Role,
        store: &Arc<RecordingStore>,
        transport: &Arc<CountingTransport>,
    ) -> (Connection, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (local, remote) = match role {
            Role::Initiator => ("alice", "bob"),
            Role::Responder => ("bob", "alice"),
        };
        let store_dyn: Arc<dyn crate::store::SignalingStore> = store.clone();
        let transport_dyn: Arc<dyn PeerTransport> = transport.clone();
        let conn = Connection::new(
            local,
            remote,
            role,
            7,
            transport_dyn,
            PairChannel::new(store_dyn, "r1"),
            ConnectionEventSender::new(tx, 1, remote, 7),
        );
        (conn, rx)
    }

    fn candidate_from(owner: &str, candidate: &str) -> CandidateRecord {
        CandidateRecord {
            owner: owner.to_string(),
            candidate: IceCandidate::new(candidate),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_initiator_publishes_offer_and_subscribes() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Initiator, &store, &transport);

        conn.start_as_initiator().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::OfferSent);
        assert_eq!(conn.pair_key().as_str(), "alice~bob");
        assert_eq!(
            store.writes.lock().unwrap().as_slice(),
            ["rooms/r1/offer/alice~bob".to_string()]
        );
        // Answer + callee candidates
        assert_eq!(store.subscriptions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_responder_uses_initiator_pair_key_and_consumes_offer() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Responder, &store, &transport);

        let offer = DescriptionRecord::new("alice", "bob", SessionDescription::offer("v=0"));
        conn.start_as_responder(offer.clone()).await.unwrap();
        assert!(conn.has_answered(&offer));

        assert_eq!(conn.pair_key(), &PairKey::new("alice", "bob"));
        assert_eq!(conn.state(), ConnectionState::DescriptionExchanged);
        assert_eq!(
            store.writes.lock().unwrap().as_slice(),
            ["rooms/r1/answer/alice~bob".to_string()]
        );
        assert!(store
            .deletes
            .lock()
            .unwrap()
            .contains(&"rooms/r1/offer/alice~bob".to_string()));
    }

    #[tokio::test]
    async fn test_remote_candidates_buffered_until_answer() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Initiator, &store, &transport);
        conn.start_as_initiator().await.unwrap();

        conn.handle_remote_candidate(candidate_from("bob", "c1")).await;
        conn.handle_remote_candidate(candidate_from("bob", "c2")).await;
        assert!(transport.remote_candidates.lock().unwrap().is_empty());

        let offer_at = conn.published_offer_at().unwrap();
        let answer = DescriptionRecord::new("bob", "alice", SessionDescription::answer("v=0"))
            .answering(offer_at);
        conn.handle_answer(answer.clone()).await.unwrap();
        assert_eq!(
            transport.remote_candidates.lock().unwrap().as_slice(),
            ["c1".to_string(), "c2".to_string()]
        );

        // A second answer is ignored
        conn.handle_answer(answer).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::DescriptionExchanged);
    }

    #[tokio::test]
    async fn test_answer_to_an_earlier_offer_is_ignored() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Initiator, &store, &transport);
        conn.start_as_initiator().await.unwrap();
        let offer_at = conn.published_offer_at().unwrap();

        // Left over from a previous attempt under the same pair key
        let stale = DescriptionRecord::new("bob", "alice", SessionDescription::answer("STALE"))
            .answering(offer_at - 1);
        conn.handle_answer(stale).await.unwrap();
        let unreferenced =
            DescriptionRecord::new("bob", "alice", SessionDescription::answer("STALE"));
        conn.handle_answer(unreferenced).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::OfferSent);
        assert_eq!(transport.remote_descriptions.load(Ordering::SeqCst), 0);
        assert!(!store
            .deletes
            .lock()
            .unwrap()
            .contains(&"rooms/r1/answer/alice~bob".to_string()));

        let fresh = DescriptionRecord::new("bob", "alice", SessionDescription::answer("v=0"))
            .answering(offer_at);
        conn.handle_answer(fresh).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::DescriptionExchanged);
        assert_eq!(transport.remote_descriptions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_candidate_from_wrong_owner_ignored() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Responder, &store, &transport);
        let offer = DescriptionRecord::new("alice", "bob", SessionDescription::offer("v=0"));
        conn.start_as_responder(offer).await.unwrap();

        conn.handle_remote_candidate(candidate_from("mallory", "c1")).await;
        conn.handle_remote_candidate(candidate_from("alice", "c2")).await;
        assert_eq!(
            transport.remote_candidates.lock().unwrap().as_slice(),
            ["c2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rejected_candidate_is_not_fatal() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport {
            reject_candidates: true,
            ..CountingTransport::default()
        });
        let (mut conn, _rx) = connection(Role::Responder, &store, &transport);
        let offer = DescriptionRecord::new("alice", "bob", SessionDescription::offer("v=0"));
        conn.start_as_responder(offer).await.unwrap();

        conn.handle_remote_candidate(candidate_from("alice", "c1")).await;
        assert!(!conn.is_closing());
        assert_eq!(conn.state(), ConnectionState::DescriptionExchanged);
    }

    #[tokio::test]
    async fn test_connected_clears_candidates_once_and_stops_trickling() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Initiator, &store, &transport);
        conn.start_as_initiator().await.unwrap();

        conn.handle_local_candidate(IceCandidate::new("l1")).await.unwrap();
        assert_eq!(store.appends.lock().unwrap().len(), 1);

        assert_eq!(
            conn.handle_state_change(TransportState::Connected).await,
            StateOutcome::Connected
        );
        assert_eq!(
            conn.handle_state_change(TransportState::Completed).await,
            StateOutcome::Unchanged
        );
        let candidate_deletes = store
            .deletes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains("Candidates"))
            .count();
        assert_eq!(candidate_deletes, 2, "both lists cleared exactly once");

        conn.handle_local_candidate(IceCandidate::new("l2")).await.unwrap();
        assert_eq!(store.appends.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_state_reports_lost() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Initiator, &store, &transport);

        assert_eq!(
            conn.handle_state_change(TransportState::Checking).await,
            StateOutcome::Unchanged
        );
        assert_eq!(
            conn.handle_state_change(TransportState::Failed).await,
            StateOutcome::Lost
        );
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let store = Arc::new(RecordingStore::default());
        let transport = Arc::new(CountingTransport::default());
        let (mut conn, _rx) = connection(Role::Initiator, &store, &transport);
        conn.start_as_initiator().await.unwrap();

        assert!(conn.teardown(TeardownReason::TransportFailed).await);
        assert!(!conn.teardown(TeardownReason::PeerLeft).await);
        assert!(!conn.teardown(TeardownReason::LocalLeave).await);

        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(store.unsubscriptions.load(Ordering::SeqCst), 2);
        assert_eq!(conn.state(), ConnectionState::Closed);
        // Initiator removes its own offer on teardown
        assert!(store
            .deletes
            .lock()
            .unwrap()
            .contains(&"rooms/r1/offer/alice~bob".to_string()));

        // Events after teardown are ignored
        assert_eq!(
            conn.handle_state_change(TransportState::Connected).await,
            StateOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_transport_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = ConnectionEventSender::new(tx, 3, "bob", 9);
        let sink = sender.transport_sink();

        sink(TransportEvent::RemoteStreamAdded);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 3);
        assert!(matches!(
            event.kind,
            SessionEventKind::Connection {
                ref peer_id,
                epoch: 9,
                event: ConnectionEvent::Transport(TransportEvent::RemoteStreamAdded),
            } if peer_id == "bob"
        ));
    }
}
