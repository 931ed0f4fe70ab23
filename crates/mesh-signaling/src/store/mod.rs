//! Signaling store contract.
//!
//! The realtime key-value store is an external dependency used purely as a
//! signaling relay. This module defines the contract the rest of the crate
//! consumes; concrete backends implement [`SignalingStore`].
//!
//! # Semantics
//!
//! - Paths are `/`-separated. Writing `null` or an empty object removes the node.
//! - [`SignalingStore::transact`] runs the closure against the value current at
//!   commit time; the closure may be invoked more than once by backends that
//!   retry optimistic transactions.
//! - [`SignalingStore::on_value_changed`] fires immediately with the current
//!   value (possibly absent), then on every change.
//! - [`SignalingStore::on_child_appended`] fires for every existing child in
//!   key order, then once per newly added child.
//! - Deferred actions run server-side when the registering client's store
//!   connection drops without an explicit cancel.
//!
//! Listener callbacks must be cheap and must not call back into the store;
//! the coordinator only forwards them onto its event queue.

pub mod paths;

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store (or this client's connection to it) is unavailable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Path is malformed or contains reserved characters.
    #[error("Invalid store path: {0}")]
    InvalidPath(String),

    /// Value could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A change notification delivered to a [`Listener`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    /// Path the subscription was registered on.
    pub path: String,
    /// Child key for child-appended events, `None` for value events.
    pub key: Option<String>,
    /// Current value (value events) or the appended child (child events).
    pub value: Option<Value>,
}

/// Callback invoked by the store for subscription events.
pub type Listener = Arc<dyn Fn(StoreEvent) + Send + Sync>;

/// Transaction update function. Receives the value current at commit time.
pub type TransactionFn = Box<dyn FnMut(Option<&Value>) -> TransactionDecision + Send>;

/// Result of a transaction update function.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionDecision {
    /// Commit the given value (`None` removes the node).
    Commit(Option<Value>),
    /// Leave the node untouched.
    Abort,
}

/// Outcome of [`SignalingStore::transact`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    /// Whether the update function committed.
    pub committed: bool,
    /// Value at the path after the transaction (committed or current).
    pub value: Option<Value>,
}

/// Mutation executed by the store when the registering client disconnects.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredMutation {
    /// Remove the node and its subtree.
    Remove,
    /// Overwrite the node with a value.
    Set(Value),
}

/// Live subscription. Unsubscribes when dropped.
///
/// Unsubscribing is synchronous but does not retract an event already in
/// flight; handlers must re-check local state before acting.
pub struct Subscription {
    path: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription whose `cancel` closure detaches the listener.
    pub fn new(path: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            path: path.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Path this subscription observes.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Detach the listener now.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Contract over the realtime store used as a signaling relay.
#[async_trait::async_trait]
pub trait SignalingStore: Send + Sync {
    /// Point read.
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditional overwrite.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge the given fields into the node at `path`.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Remove the node and its subtree.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Atomic conditional update.
    async fn transact(
        &self,
        path: &str,
        apply: TransactionFn,
    ) -> Result<TransactionOutcome, StoreError>;

    /// Append `value` under a generated, monotonically ordered key.
    async fn append_unique(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Observe the value at `path`.
    async fn on_value_changed(
        &self,
        path: &str,
        listener: Listener,
    ) -> Result<Subscription, StoreError>;

    /// Observe children appended under `path`.
    async fn on_child_appended(
        &self,
        path: &str,
        listener: Listener,
    ) -> Result<Subscription, StoreError>;

    /// Register `mutation` to run on `path` if this client disconnects.
    async fn defer_on_disconnect(
        &self,
        path: &str,
        mutation: DeferredMutation,
    ) -> Result<(), StoreError>;

    /// Cancel any deferred mutation registered on `path` by this client.
    async fn cancel_deferred(&self, path: &str) -> Result<(), StoreError>;
}
