//! `MeshCoordinator` - owns the local session and its connections.
//!
//! The coordinator is the single thread of control for one local peer:
//! - Commands (join, leave, state) arrive through the handle's mailbox
//! - Store listeners and transport sinks only post [`SessionEvent`]s
//! - Membership changes drive connection creation and teardown
//! - Room-level disconnect cleanup is armed while the local peer is alone
//!
//! # Initiator designation
//!
//! For every pair, the peer with the lexicographically smaller id opens the
//! connection and the other only answers. Both sides apply the rule on join
//! and on every membership notification, so exactly one offer is published
//! per pair key.

use crate::admission::{self, RoomAdmission};
use crate::config::MeshConfig;
use crate::errors::MeshError;
use crate::observability::metrics;
use crate::pair_channel::{DescriptionRecord, PairChannel, PairKey};
use crate::store::{paths, Listener, SignalingStore, StoreEvent, Subscription};
use crate::transport::{SdpType, TransportEvent, TransportFactory};

use super::connection::{Connection, ConnectionEventSender, StateOutcome};
use super::messages::{
    ConnectionEvent, CoordinatorMessage, JoinedRoom, MeshEvent, MeshState, Role, SessionEvent,
    SessionEventKind, TeardownReason,
};

use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 32;

/// Handle to a `MeshCoordinator`.
#[derive(Clone, Debug)]
pub struct MeshCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    events: broadcast::Sender<MeshEvent>,
    cancel_token: CancellationToken,
}

impl MeshCoordinatorHandle {
    /// Join `room_id`, or a freshly generated room when `None` and
    /// `create_if_missing` is set.
    pub async fn join(
        &self,
        room_id: Option<String>,
        create_if_missing: bool,
    ) -> Result<JoinedRoom, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Join {
                room_id,
                create_if_missing,
                respond_to: tx,
            })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the current room. No-op when not in a room.
    pub async fn leave(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Leave { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get a snapshot of the coordinator state.
    pub async fn state(&self) -> Result<MeshState, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Subscribe to mesh events. Slow receivers observe `Lagged`.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Cancel the coordinator. The actor leaves the room before exiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// State of the room the local peer is in.
struct Session {
    room_id: String,
    local_peer_id: String,
    generation: u64,
    channel: PairChannel,
    members: BTreeSet<String>,
    connections: HashMap<String, Connection>,
    /// Offers from peers not yet seen in the member list, keyed by sender.
    pending_offers: HashMap<String, (String, DescriptionRecord)>,
    membership_subscription: Option<Subscription>,
    offer_subscription: Option<Subscription>,
    room_cleanup_armed: bool,
    next_epoch: u64,
    transports: Arc<dyn TransportFactory>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    mesh_events: broadcast::Sender<MeshEvent>,
}

impl Session {
    fn emit(&self, event: MeshEvent) {
        // No receivers is fine.
        let _ = self.mesh_events.send(event);
    }

    fn state(&self) -> MeshState {
        let mut connections: Vec<_> = self.connections.values().map(Connection::info).collect();
        connections.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        MeshState {
            room_id: Some(self.room_id.clone()),
            local_peer_id: Some(self.local_peer_id.clone()),
            members: self.members.iter().cloned().collect(),
            connections,
            room_cleanup_armed: self.room_cleanup_armed,
        }
    }

    fn update_active_gauge(&self) {
        metrics::set_connections_active(self.connections.len());
    }

    /// Create a transport and a connection shell for `remote_peer_id`.
    async fn create_connection(&mut self, remote_peer_id: &str, role: Role) -> Option<Connection> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let events = ConnectionEventSender::new(
            self.session_events.clone(),
            self.generation,
            remote_peer_id,
            epoch,
        );

        match self
            .transports
            .create(&self.local_peer_id, remote_peer_id, events.transport_sink())
            .await
        {
            Ok(transport) => Some(Connection::new(
                &self.local_peer_id,
                remote_peer_id,
                role,
                epoch,
                transport,
                self.channel.clone(),
                events,
            )),
            Err(e) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    room_id = %self.room_id,
                    peer_id = %remote_peer_id,
                    error = %e,
                    "Failed to create transport"
                );
                None
            }
        }
    }

    /// Open a connection to a peer the local peer is designated to call.
    async fn open_initiator(&mut self, remote_peer_id: &str) {
        let Some(mut connection) = self.create_connection(remote_peer_id, Role::Initiator).await
        else {
            return;
        };

        if let Err(e) = connection.start_as_initiator().await {
            self.abandon(connection, &e).await;
            return;
        }

        debug!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            peer_id = %remote_peer_id,
            epoch = connection.epoch(),
            "Initiator connection opened"
        );
        self.connections.insert(remote_peer_id.to_string(), connection);
        self.update_active_gauge();
    }

    /// Answer an inbound offer with a new responder connection.
    async fn open_responder(&mut self, offer: DescriptionRecord) {
        let remote_peer_id = offer.from.clone();
        let Some(mut connection) = self.create_connection(&remote_peer_id, Role::Responder).await
        else {
            return;
        };

        if let Err(e) = connection.start_as_responder(offer).await {
            self.abandon(connection, &e).await;
            return;
        }

        debug!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            peer_id = %remote_peer_id,
            epoch = connection.epoch(),
            "Responder connection opened"
        );
        self.connections.insert(remote_peer_id, connection);
        self.update_active_gauge();
    }

    /// Tear down a connection whose negotiation failed before it was tracked.
    async fn abandon(&self, mut connection: Connection, error: &MeshError) {
        warn!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            peer_id = %connection.remote_peer_id(),
            error = %error,
            "Negotiation failed, tearing down connection"
        );
        if connection.teardown(TeardownReason::NegotiationFailed).await {
            self.emit(MeshEvent::RemoteStreamRemoved {
                peer_id: connection.remote_peer_id().to_string(),
                reason: TeardownReason::NegotiationFailed,
            });
        }
    }

    /// Remove and tear down the connection to `peer_id`, if any.
    async fn teardown_connection(&mut self, peer_id: &str, reason: TeardownReason) {
        let Some(mut connection) = self.connections.remove(peer_id) else {
            return;
        };
        if connection.teardown(reason).await {
            self.emit(MeshEvent::RemoteStreamRemoved {
                peer_id: peer_id.to_string(),
                reason,
            });
        }
        self.update_active_gauge();
    }

    /// Tear down every connection concurrently.
    async fn teardown_all(&mut self, reason: TeardownReason) {
        let connections: Vec<Connection> = self.connections.drain().map(|(_, c)| c).collect();
        let results = join_all(connections.into_iter().map(|mut connection| async move {
            let torn_down = connection.teardown(reason).await;
            (connection.remote_peer_id().to_string(), torn_down)
        }))
        .await;

        for (peer_id, torn_down) in results {
            if torn_down {
                self.emit(MeshEvent::RemoteStreamRemoved { peer_id, reason });
            }
        }
        self.update_active_gauge();
    }

    /// Open initiator connections to every designated remote without one.
    async fn connect_designated(&mut self) {
        let targets: Vec<String> = self
            .members
            .iter()
            .filter(|peer| {
                **peer != self.local_peer_id
                    && Role::for_pair(&self.local_peer_id, peer) == Role::Initiator
                    && !self.connections.contains_key(peer.as_str())
            })
            .cloned()
            .collect();

        for peer in targets {
            self.open_initiator(&peer).await;
        }
    }

    /// Arm room deletion while alone, disarm as soon as anyone else is present.
    async fn evaluate_room_cleanup(&mut self, admission: &RoomAdmission) {
        let sole_member =
            self.members.len() == 1 && self.members.contains(self.local_peer_id.as_str());

        if sole_member && !self.room_cleanup_armed {
            match admission.arm_room_cleanup(&self.room_id).await {
                Ok(()) => self.room_cleanup_armed = true,
                Err(e) => {
                    warn!(
                        target: "mesh.actor.coordinator",
                        room_id = %self.room_id,
                        error = %e,
                        "Failed to arm room disconnect cleanup"
                    );
                }
            }
        } else if !sole_member && self.room_cleanup_armed {
            admission.disarm_room_cleanup(&self.room_id).await;
            self.room_cleanup_armed = false;
        }
    }

    /// Reconcile connections with the room's member list.
    ///
    /// Returns `false` when the local peer is no longer listed; the caller
    /// ends the session.
    async fn handle_members_changed(
        &mut self,
        members: Vec<String>,
        admission: &RoomAdmission,
    ) -> bool {
        let members: BTreeSet<String> = members.into_iter().collect();
        if !members.contains(self.local_peer_id.as_str()) {
            warn!(
                target: "mesh.actor.coordinator",
                room_id = %self.room_id,
                peer_id = %self.local_peer_id,
                "Local member record removed from the room"
            );
            return false;
        }

        let departed: Vec<String> = self
            .connections
            .keys()
            .filter(|peer| !members.contains(peer.as_str()))
            .cloned()
            .collect();
        for peer in departed {
            debug!(
                target: "mesh.actor.coordinator",
                room_id = %self.room_id,
                peer_id = %peer,
                "Peer left the room"
            );
            self.teardown_connection(&peer, TeardownReason::PeerLeft)
                .await;
        }

        self.members = members;
        self.connect_designated().await;
        self.evaluate_room_cleanup(admission).await;

        let admitted: Vec<String> = self
            .pending_offers
            .keys()
            .filter(|peer| self.members.contains(peer.as_str()))
            .cloned()
            .collect();
        for peer in admitted {
            if let Some((key, offer)) = self.pending_offers.remove(&peer) {
                self.handle_offer(&key, offer).await;
            }
        }

        self.emit(MeshEvent::MembershipChanged {
            room_id: self.room_id.clone(),
            members: self.members.iter().cloned().collect(),
        });
        true
    }

    async fn handle_offer(&mut self, key: &str, offer: DescriptionRecord) {
        let expected_key = PairKey::new(&offer.from, &offer.to);
        let well_formed = key == expected_key.as_str()
            && offer.to == self.local_peer_id
            && offer.from != self.local_peer_id
            && offer.description.sdp_type == SdpType::Offer;
        if !well_formed {
            debug!(
                target: "mesh.actor.coordinator",
                room_id = %self.room_id,
                key = %key,
                "Ignoring offer with mismatched pair key"
            );
            return;
        }

        if Role::for_pair(&self.local_peer_id, &offer.from) == Role::Initiator {
            debug!(
                target: "mesh.actor.coordinator",
                room_id = %self.room_id,
                peer_id = %offer.from,
                "Ignoring offer from peer the local peer is designated to call"
            );
            return;
        }

        if !self.members.contains(offer.from.as_str()) {
            debug!(
                target: "mesh.actor.coordinator",
                room_id = %self.room_id,
                peer_id = %offer.from,
                "Holding offer from peer not in the member list"
            );
            self.pending_offers
                .insert(offer.from.clone(), (key.to_string(), offer));
            return;
        }

        // A new offer under the same key means the initiator restarted.
        if let Some(existing) = self.connections.get(&offer.from) {
            if existing.pair_key() == &expected_key && existing.has_answered(&offer) {
                debug!(
                    target: "mesh.actor.coordinator",
                    room_id = %self.room_id,
                    peer_id = %offer.from,
                    "Duplicate offer for live responder connection"
                );
                return;
            }
            let stale = offer.from.clone();
            self.teardown_connection(&stale, TeardownReason::Superseded)
                .await;
        }

        self.open_responder(offer).await;
    }

    async fn handle_connection_event(&mut self, peer_id: &str, epoch: u64, event: ConnectionEvent) {
        let Some(connection) = self.connections.get_mut(peer_id) else {
            debug!(
                target: "mesh.actor.coordinator",
                peer_id = %peer_id,
                "Dropping event for unknown connection"
            );
            return;
        };
        if connection.epoch() != epoch || connection.is_closing() {
            debug!(
                target: "mesh.actor.coordinator",
                peer_id = %peer_id,
                epoch = epoch,
                current_epoch = connection.epoch(),
                "Dropping stale connection event"
            );
            return;
        }

        let outcome = match event {
            ConnectionEvent::Answer(record) => connection
                .handle_answer(record)
                .await
                .map(|()| StateOutcome::Unchanged),
            ConnectionEvent::RemoteCandidate(record) => {
                connection.handle_remote_candidate(record).await;
                Ok(StateOutcome::Unchanged)
            }
            ConnectionEvent::Transport(TransportEvent::RemoteStreamAdded) => {
                self.emit(MeshEvent::RemoteStreamAdded {
                    peer_id: peer_id.to_string(),
                });
                return;
            }
            ConnectionEvent::Transport(event) => connection.handle_transport_event(event).await,
        };

        match outcome {
            Ok(StateOutcome::Unchanged) => {}
            Ok(StateOutcome::Connected) => {
                self.emit(MeshEvent::PeerConnected {
                    peer_id: peer_id.to_string(),
                });
            }
            Ok(StateOutcome::Lost) => {
                self.teardown_connection(peer_id, TeardownReason::TransportFailed)
                    .await;
            }
            Err(e) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Negotiation failed, tearing down connection"
                );
                self.teardown_connection(peer_id, TeardownReason::NegotiationFailed)
                    .await;
            }
        }
    }
}

/// The `MeshCoordinator` implementation.
pub struct MeshCoordinator {
    config: MeshConfig,
    store: Arc<dyn SignalingStore>,
    transports: Arc<dyn TransportFactory>,
    admission: RoomAdmission,
    /// Command receiver.
    receiver: mpsc::Receiver<CoordinatorMessage>,
    /// Sender cloned into every listener and transport sink.
    session_events_tx: mpsc::UnboundedSender<SessionEvent>,
    session_events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    mesh_events: broadcast::Sender<MeshEvent>,
    cancel_token: CancellationToken,
    /// Incremented on every join; events from older sessions are dropped.
    generation: u64,
    session: Option<Session>,
}

impl MeshCoordinator {
    /// Spawn a new coordinator.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        config: MeshConfig,
        store: Arc<dyn SignalingStore>,
        transports: Arc<dyn TransportFactory>,
        cancel_token: CancellationToken,
    ) -> (MeshCoordinatorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();
        let (mesh_events, _) = broadcast::channel(config.event_channel_capacity.max(1));

        let actor = Self {
            admission: RoomAdmission::new(Arc::clone(&store), config.room_capacity),
            config,
            store,
            transports,
            receiver,
            session_events_tx,
            session_events_rx,
            mesh_events: mesh_events.clone(),
            cancel_token: cancel_token.clone(),
            generation: 0,
            session: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = MeshCoordinatorHandle {
            sender,
            events: mesh_events,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Spawn a coordinator configured from `MESH_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Config` when a variable is present but invalid.
    pub fn spawn_from_env(
        store: Arc<dyn SignalingStore>,
        transports: Arc<dyn TransportFactory>,
        cancel_token: CancellationToken,
    ) -> Result<(MeshCoordinatorHandle, JoinHandle<()>), MeshError> {
        let config = MeshConfig::from_env()?;
        Ok(Self::spawn(config, store, transports, cancel_token))
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "mesh.actor.coordinator")]
    async fn run(mut self) {
        debug!(target: "mesh.actor.coordinator", "MeshCoordinator started");

        let mut presence = presence_interval(self.config.presence_refresh_interval);

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "mesh.actor.coordinator",
                        "MeshCoordinator received cancellation signal"
                    );
                    self.handle_leave(TeardownReason::Shutdown).await;
                    break;
                }

                // Handle commands
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            debug!(
                                target: "mesh.actor.coordinator",
                                "MeshCoordinator channel closed, exiting"
                            );
                            self.handle_leave(TeardownReason::Shutdown).await;
                            break;
                        }
                    }
                }

                // Handle store and transport notifications
                Some(event) = self.session_events_rx.recv() => {
                    self.handle_session_event(event).await;
                }

                // Presence heartbeat
                () = next_tick(&mut presence) => {
                    self.refresh_presence().await;
                }
            }
        }

        debug!(target: "mesh.actor.coordinator", "MeshCoordinator stopped");
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Join {
                room_id,
                create_if_missing,
                respond_to,
            } => {
                let result = self.handle_join(room_id, create_if_missing).await;
                if let Err(e) = &result {
                    if e.is_admission_error() {
                        info!(
                            target: "mesh.actor.coordinator",
                            error_code = e.error_code(),
                            error = %e,
                            "Join rejected"
                        );
                    } else {
                        warn!(
                            target: "mesh.actor.coordinator",
                            error_code = e.error_code(),
                            error = %e,
                            "Join failed"
                        );
                    }
                }
                let _ = respond_to.send(result);
            }
            CoordinatorMessage::Leave { respond_to } => {
                self.handle_leave(TeardownReason::LocalLeave).await;
                let _ = respond_to.send(Ok(()));
            }
            CoordinatorMessage::GetState { respond_to } => {
                let state = self
                    .session
                    .as_ref()
                    .map(Session::state)
                    .unwrap_or_default();
                let _ = respond_to.send(state);
            }
        }
    }

    async fn handle_join(
        &mut self,
        room_id: Option<String>,
        create_if_missing: bool,
    ) -> Result<JoinedRoom, MeshError> {
        if let Some(session) = &self.session {
            return Err(MeshError::AlreadyInRoom(session.room_id.clone()));
        }

        let room_id = match room_id {
            Some(id) => {
                admission::validate_room_id(&id)?;
                id
            }
            None if create_if_missing => admission::generate_room_id(self.config.room_id_length),
            None => return Err(MeshError::InvalidRoomId(String::new())),
        };

        let room = self
            .admission
            .create_or_get_room(&room_id, create_if_missing)
            .await
            .inspect_err(|e| {
                if matches!(e, MeshError::RoomNotFound(_)) {
                    metrics::record_admission("room_not_found");
                }
            })?;

        let peer_id = self
            .config
            .peer_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let members = match self.admission.join_room(&room.room_id, &peer_id).await {
            Ok(members) => members,
            Err(e) => {
                // Do not leave behind a room this call created but never entered.
                if room.created {
                    let _ = self.admission.remove_room_if_empty(&room.room_id).await;
                }
                return Err(e);
            }
        };

        match self.establish_session(&room.room_id, &peer_id, &members).await {
            Ok(()) => {}
            Err(e) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    room_id = %room.room_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Session setup failed after admission, rolling back membership"
                );
                if let Some(mut session) = self.session.take() {
                    session.teardown_all(TeardownReason::LocalLeave).await;
                }
                self.admission.leave_room(&room.room_id, &peer_id).await;
                let _ = self.admission.remove_room_if_empty(&room.room_id).await;
                return Err(e);
            }
        }

        info!(
            target: "mesh.actor.coordinator",
            room_id = %room.room_id,
            peer_id = %peer_id,
            members = members.len(),
            created = room.created,
            "Joined mesh"
        );

        let joined = JoinedRoom {
            room_id: room.room_id,
            peer_id,
            members,
        };
        let _ = self.mesh_events.send(MeshEvent::Joined {
            room_id: joined.room_id.clone(),
            peer_id: joined.peer_id.clone(),
            members: joined.members.clone(),
        });
        Ok(joined)
    }

    async fn establish_session(
        &mut self,
        room_id: &str,
        peer_id: &str,
        members: &[String],
    ) -> Result<(), MeshError> {
        self.generation += 1;
        let generation = self.generation;
        let channel = PairChannel::new(Arc::clone(&self.store), room_id);

        let membership_tx = self.session_events_tx.clone();
        let membership_listener: Listener = Arc::new(move |event: StoreEvent| {
            let members = admission::parse_members(event.value.as_ref())
                .into_keys()
                .collect();
            let _ = membership_tx.send(SessionEvent {
                generation,
                kind: SessionEventKind::MembersChanged(members),
            });
        });
        let membership_subscription = self
            .store
            .on_value_changed(&paths::members(room_id), membership_listener)
            .await?;

        let offers_tx = self.session_events_tx.clone();
        let offer_subscription = channel
            .subscribe_offers_addressed_to(peer_id, move |key, record| {
                let _ = offers_tx.send(SessionEvent {
                    generation,
                    kind: SessionEventKind::OfferReceived { key, record },
                });
            })
            .await?;

        let session = self.session.insert(Session {
            room_id: room_id.to_string(),
            local_peer_id: peer_id.to_string(),
            generation,
            channel,
            members: members.iter().cloned().collect(),
            connections: HashMap::new(),
            pending_offers: HashMap::new(),
            membership_subscription: Some(membership_subscription),
            offer_subscription: Some(offer_subscription),
            room_cleanup_armed: false,
            next_epoch: 1,
            transports: Arc::clone(&self.transports),
            session_events: self.session_events_tx.clone(),
            mesh_events: self.mesh_events.clone(),
        });

        session.connect_designated().await;
        session.evaluate_room_cleanup(&self.admission).await;
        Ok(())
    }

    /// Leave the current room, if any. Every step is best-effort.
    async fn handle_leave(&mut self, reason: TeardownReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Some(subscription) = session.membership_subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(subscription) = session.offer_subscription.take() {
            subscription.unsubscribe();
        }

        session.teardown_all(reason).await;

        self.admission
            .leave_room(&session.room_id, &session.local_peer_id)
            .await;
        match self.admission.remove_room_if_empty(&session.room_id).await {
            Ok(removed) => {
                debug!(
                    target: "mesh.actor.coordinator",
                    room_id = %session.room_id,
                    removed = removed,
                    "Checked room for removal after leave"
                );
            }
            Err(e) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    room_id = %session.room_id,
                    error = %e,
                    "Failed to remove empty room after leave"
                );
            }
        }

        info!(
            target: "mesh.actor.coordinator",
            room_id = %session.room_id,
            peer_id = %session.local_peer_id,
            reason = %reason,
            "Left mesh"
        );
        session.emit(MeshEvent::Left {
            room_id: session.room_id.clone(),
        });
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if event.generation != session.generation {
            debug!(
                target: "mesh.actor.coordinator",
                generation = event.generation,
                current_generation = session.generation,
                "Dropping event from previous session"
            );
            return;
        }

        match event.kind {
            SessionEventKind::MembersChanged(members) => {
                let still_member = session
                    .handle_members_changed(members, &self.admission)
                    .await;
                if !still_member {
                    self.handle_leave(TeardownReason::MembershipLost).await;
                }
            }
            SessionEventKind::OfferReceived { key, record } => {
                session.handle_offer(&key, record).await;
            }
            SessionEventKind::Connection {
                peer_id,
                epoch,
                event,
            } => {
                session
                    .handle_connection_event(&peer_id, epoch, event)
                    .await;
            }
        }
    }

    async fn refresh_presence(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = self
            .admission
            .refresh_last_seen(&session.room_id, &session.local_peer_id)
            .await
        {
            warn!(
                target: "mesh.actor.coordinator",
                room_id = %session.room_id,
                error = %e,
                "Presence refresh failed"
            );
        }
    }
}

/// Heartbeat interval, `None` when disabled. The first tick fires one full
/// period after start.
fn presence_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(interval)
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
