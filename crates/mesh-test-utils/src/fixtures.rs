//! Test fixtures for coordinator scenarios.
//!
//! Provides:
//! - `init_test_tracing` to route `tracing` output through the test harness
//! - `assert_eventually` for polling conditions that settle asynchronously
//! - `TestPeer`, a coordinator wired to its own store client and transports

use mesh_signaling::actors::{MeshCoordinator, MeshCoordinatorHandle, MeshEvent, MeshState};
use mesh_signaling::config::MeshConfig;
use mesh_signaling::store::SignalingStore;
use mesh_signaling::transport::TransportFactory;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::mock_store::{MockStore, MockStoreClient};
use crate::mock_transport::{MockTransportFactory, MockTransportOptions};

/// Default timeout for scenario assertions.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between condition polls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Install a test-writer subscriber once. Honors `RUST_LOG`, defaults to `warn`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn assert_eventually<F, Fut>(timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(format!("Condition not met within {timeout:?}"));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait for the first event matching `predicate`.
pub async fn wait_for_event<P>(
    events: &mut broadcast::Receiver<MeshEvent>,
    timeout: Duration,
    mut predicate: P,
) -> Result<MeshEvent, String>
where
    P: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("event channel closed".to_string());
                }
            }
        }
    })
    .await
    .map_err(|_| format!("No matching event within {timeout:?}"))?
}

/// A coordinator with its own store client and transport factory.
pub struct TestPeer {
    pub peer_id: String,
    pub handle: MeshCoordinatorHandle,
    pub task: JoinHandle<()>,
    pub store: MockStoreClient,
    pub transports: Arc<MockTransportFactory>,
    pub cancel_token: CancellationToken,
}

impl TestPeer {
    /// Spawn a peer with a fixed id and the heartbeat disabled.
    pub fn spawn(store: &MockStore, peer_id: &str) -> Self {
        Self::spawn_with(store, peer_id, MockTransportOptions::default())
    }

    /// Spawn a peer whose transports behave per `options`.
    pub fn spawn_with(store: &MockStore, peer_id: &str, options: MockTransportOptions) -> Self {
        let config = MeshConfig {
            presence_refresh_interval: Duration::ZERO,
            ..MeshConfig::default()
        }
        .with_peer_id(peer_id);

        let client = store.client();
        let transports = Arc::new(MockTransportFactory::with_options(options));
        let cancel_token = CancellationToken::new();

        let store_dyn: Arc<dyn SignalingStore> = Arc::new(client.clone());
        let transports_dyn: Arc<dyn TransportFactory> = transports.clone();
        let (handle, task) =
            MeshCoordinator::spawn(config, store_dyn, transports_dyn, cancel_token.clone());

        Self {
            peer_id: peer_id.to_string(),
            handle,
            task,
            store: client,
            transports,
            cancel_token,
        }
    }

    /// Current coordinator state.
    pub async fn state(&self) -> MeshState {
        self.handle.state().await.expect("coordinator should respond")
    }

    /// Wait until this peer reports a connected connection to every id in `peers`.
    pub async fn wait_connected_to(&self, peers: &[&str]) -> Result<(), String> {
        assert_eventually(DEFAULT_SETTLE_TIMEOUT, || async move {
            let state = self.state().await;
            peers.iter().all(|peer| {
                state.connection(peer).is_some_and(|c| {
                    c.state == mesh_signaling::actors::ConnectionState::Connected
                })
            })
        })
        .await
    }

    /// Simulate the process vanishing: the store runs this client's deferred
    /// actions, then the coordinator is stopped.
    pub async fn vanish(self) {
        self.store.disconnect();
        self.cancel_token.cancel();
        let _ = self.task.await;
    }

    /// Cancel the coordinator and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        let _ = self.task.await;
    }
}
