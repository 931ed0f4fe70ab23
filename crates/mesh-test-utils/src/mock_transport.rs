//! Deterministic fake media transport.
//!
//! A [`MockTransport`] emits two local candidates when its local description
//! is set, and reports `Checking` then `Connected` (plus the remote stream)
//! once it has a local description, a remote description and at least one
//! remote candidate. Nothing crosses between the two sides of a pair except
//! what the signaling layer relays, so a connected pair proves the exchange.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_test_utils::MockTransportFactory;
//!
//! let factory = Arc::new(MockTransportFactory::new());
//! // ... run a coordinator with it, then inject a failure:
//! factory.transport_for("bob").unwrap().emit_state(TransportState::Failed);
//! ```

use mesh_signaling::transport::{
    IceCandidate, PeerTransport, SessionDescription, TransportError, TransportEvent,
    TransportEventSink, TransportFactory, TransportState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Behavior switches for transports created by a factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockTransportOptions {
    /// `add_remote_candidate` always fails.
    pub reject_candidates: bool,
    /// `create_offer` always fails.
    pub fail_create_offer: bool,
    /// `create_answer` always fails.
    pub fail_create_answer: bool,
}

#[derive(Debug)]
struct MockTransportInner {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    state: TransportState,
}

/// One fake transport.
pub struct MockTransport {
    local_peer_id: String,
    remote_peer_id: String,
    options: MockTransportOptions,
    events: TransportEventSink,
    inner: Mutex<MockTransportInner>,
    close_count: AtomicUsize,
}

impl MockTransport {
    fn new(
        local_peer_id: &str,
        remote_peer_id: &str,
        options: MockTransportOptions,
        events: TransportEventSink,
    ) -> Self {
        Self {
            local_peer_id: local_peer_id.to_string(),
            remote_peer_id: remote_peer_id.to_string(),
            options,
            events,
            inner: Mutex::new(MockTransportInner {
                local_description: None,
                remote_description: None,
                remote_candidates: Vec::new(),
                state: TransportState::New,
            }),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    /// Current transport state.
    pub fn state(&self) -> TransportState {
        self.inner.lock().unwrap().state
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Remote candidates applied so far, in order.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().remote_candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().unwrap().remote_description.clone()
    }

    /// Inject a state change, as if reported by the media stack.
    pub fn emit_state(&self, state: TransportState) {
        self.inner.lock().unwrap().state = state;
        (self.events)(TransportEvent::StateChanged(state));
    }

    /// Inject an arbitrary event.
    pub fn emit(&self, event: TransportEvent) {
        (self.events)(event);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.lock().unwrap().state == TransportState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Report connectivity once both descriptions and a remote candidate exist.
    fn maybe_connect(&self) {
        let connect = {
            let mut inner = self.inner.lock().unwrap();
            let ready = inner.state == TransportState::New
                && inner.local_description.is_some()
                && inner.remote_description.is_some()
                && !inner.remote_candidates.is_empty();
            if ready {
                inner.state = TransportState::Connected;
            }
            ready
        };

        if connect {
            (self.events)(TransportEvent::StateChanged(TransportState::Checking));
            (self.events)(TransportEvent::StateChanged(TransportState::Connected));
            (self.events)(TransportEvent::RemoteStreamAdded);
        }
    }

    fn local_candidate(&self, n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host ufrag {}",
                self.local_peer_id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.local_peer_id.clone()),
        }
    }
}

#[async_trait::async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.options.fail_create_offer {
            return Err(TransportError::Description("injected offer failure".to_string()));
        }
        Ok(SessionDescription::offer(format!(
            "v=0 offer {}->{}",
            self.local_peer_id, self.remote_peer_id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.options.fail_create_answer {
            return Err(TransportError::Description("injected answer failure".to_string()));
        }
        if self.inner.lock().unwrap().remote_description.is_none() {
            return Err(TransportError::Description(
                "answer requested without remote offer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 answer {}->{}",
            self.local_peer_id, self.remote_peer_id
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.lock().unwrap().local_description = Some(description);

        for n in 1..=2 {
            (self.events)(TransportEvent::LocalCandidate(self.local_candidate(n)));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.lock().unwrap().remote_description = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.options.reject_candidates {
            return Err(TransportError::Candidate(candidate.candidate));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.remote_description.is_none() {
                return Err(TransportError::Candidate(
                    "candidate before remote description".to_string(),
                ));
            }
            inner.remote_candidates.push(candidate);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().state = TransportState::Closed;
        Ok(())
    }
}

/// Factory that records every transport it creates.
#[derive(Default)]
pub struct MockTransportFactory {
    options: MockTransportOptions,
    created: Mutex<Vec<Arc<MockTransport>>>,
    fail_create: Mutex<bool>,
}

impl MockTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_options(options: MockTransportOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Make every subsequent `create` fail.
    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock().unwrap() = fail;
    }

    /// Total transports created.
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent transport created for `remote_peer_id`.
    pub fn transport_for(&self, remote_peer_id: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.remote_peer_id == remote_peer_id)
            .cloned()
    }

    /// Every transport created for `remote_peer_id`, oldest first.
    pub fn transports_for(&self, remote_peer_id: &str) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.remote_peer_id == remote_peer_id)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        local_peer_id: &str,
        remote_peer_id: &str,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if *self.fail_create.lock().unwrap() {
            return Err(TransportError::Backend("injected create failure".to_string()));
        }
        let transport = Arc::new(MockTransport::new(
            local_peer_id,
            remote_peer_id,
            self.options,
            events,
        ));
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}
