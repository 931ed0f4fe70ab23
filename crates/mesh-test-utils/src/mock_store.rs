//! In-memory signaling store mock.
//!
//! Implements the whole [`SignalingStore`] contract over a shared JSON tree:
//! - Atomic transactions (the tree is behind one mutex)
//! - Value and child-append subscriptions with immediate/replay delivery
//! - Ordered `append_unique` keys
//! - Per-client deferred actions run by [`MockStoreClient::disconnect`]
//!
//! Each [`MockStoreClient`] plays one store connection. Listeners are invoked
//! while the tree lock is held, which preserves delivery order across clients;
//! listeners must not call back into the store.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_test_utils::MockStore;
//!
//! let store = MockStore::new();
//! let alice = store.client();
//! let bob = store.client();
//!
//! // ... join both, then simulate bob vanishing:
//! bob.disconnect();
//! assert!(!store.exists("rooms/r1/members/bob"));
//! ```

use mesh_signaling::store::{
    paths, DeferredMutation, Listener, SignalingStore, StoreError, StoreEvent, Subscription,
    TransactionDecision, TransactionFn, TransactionOutcome,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

struct ValueListener {
    id: u64,
    client_id: u64,
    path: String,
    listener: Listener,
    last: Option<Value>,
}

struct ChildListener {
    id: u64,
    client_id: u64,
    path: String,
    listener: Listener,
    known: BTreeSet<String>,
}

#[derive(Default)]
struct MockStoreInner {
    root: Map<String, Value>,
    next_client_id: u64,
    next_listener_id: u64,
    next_append: u64,
    value_listeners: Vec<ValueListener>,
    child_listeners: Vec<ChildListener>,
    /// Deferred mutations per client, by path.
    deferred: HashMap<u64, BTreeMap<String, DeferredMutation>>,
    disconnected: HashSet<u64>,
    fail_writes: bool,
    fail_deletes: bool,
    fail_defers: bool,
    transactions: usize,
}

impl MockStoreInner {
    fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('/');
        let first = segments.next()?;
        let mut node = self.root.get(first)?;
        for segment in segments {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    fn set(&mut self, path: &str, value: Option<Value>) {
        let segments: Vec<&str> = path.split('/').collect();
        set_at(&mut self.root, &segments, value.and_then(normalize));
        self.notify();
    }

    fn child_keys(&self, path: &str) -> BTreeSet<String> {
        self.get(path)
            .and_then(Value::as_object)
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver pending notifications. Called after every mutation.
    fn notify(&mut self) {
        let mut deliveries: Vec<(Listener, StoreEvent)> = Vec::new();

        let snapshots: Vec<Option<Value>> = self
            .value_listeners
            .iter()
            .map(|l| self.get(&l.path).cloned())
            .collect();
        for (listener, current) in self.value_listeners.iter_mut().zip(snapshots) {
            if listener.last != current {
                listener.last = current.clone();
                deliveries.push((
                    Arc::clone(&listener.listener),
                    StoreEvent {
                        path: listener.path.clone(),
                        key: None,
                        value: current,
                    },
                ));
            }
        }

        let child_snapshots: Vec<BTreeSet<String>> = self
            .child_listeners
            .iter()
            .map(|l| self.child_keys(&l.path))
            .collect();
        for (index, current) in child_snapshots.into_iter().enumerate() {
            let path = self.child_listeners[index].path.clone();
            let added: Vec<String> = current
                .difference(&self.child_listeners[index].known)
                .cloned()
                .collect();
            for key in added {
                let value = self.get(&format!("{path}/{key}")).cloned();
                deliveries.push((
                    Arc::clone(&self.child_listeners[index].listener),
                    StoreEvent {
                        path: path.clone(),
                        key: Some(key),
                        value,
                    },
                ));
            }
            self.child_listeners[index].known = current;
        }

        for (listener, event) in deliveries {
            listener(event);
        }
    }

    fn check_client(&self, client_id: u64) -> Result<(), StoreError> {
        if self.disconnected.contains(&client_id) {
            return Err(StoreError::Unavailable("client disconnected".to_string()));
        }
        Ok(())
    }
}

fn set_at(node: &mut Map<String, Value>, segments: &[&str], value: Option<Value>) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        match value {
            Some(value) => {
                node.insert((*first).to_string(), value);
            }
            None => {
                node.remove(*first);
            }
        }
        return;
    }

    let child = node
        .entry((*first).to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(children) = child {
        set_at(children, rest, value);
        if children.is_empty() {
            node.remove(*first);
        }
    }
}

/// Strip nulls and empty objects; `None` if nothing remains.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        other => Some(other),
    }
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    if path.split('/').all(paths::is_valid_key) {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

/// Shared in-memory store. Hand out one [`MockStoreClient`] per simulated peer.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<MockStoreInner>>,
}

impl MockStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection.
    #[must_use]
    pub fn client(&self) -> MockStoreClient {
        let mut inner = self.inner.lock().unwrap();
        inner.next_client_id += 1;
        MockStoreClient {
            id: inner.next_client_id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Read a value directly, bypassing any client.
    pub fn value(&self, path: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(path).cloned()
    }

    /// Whether a node exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.value(path).is_some()
    }

    /// Number of children of the node at `path`.
    pub fn child_count(&self, path: &str) -> usize {
        self.inner.lock().unwrap().child_keys(path).len()
    }

    /// Write a value directly, bypassing any client (seeding fixtures).
    pub fn seed(&self, path: &str, value: Value) {
        self.inner.lock().unwrap().set(path, Some(value));
    }

    /// Make every subsequent `write` and `append_unique` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    /// Make every subsequent `delete` fail.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_deletes = fail;
    }

    /// Make every subsequent `defer_on_disconnect` fail.
    pub fn set_fail_defers(&self, fail: bool) {
        self.inner.lock().unwrap().fail_defers = fail;
    }

    /// Number of transactions run so far.
    pub fn transaction_count(&self) -> usize {
        self.inner.lock().unwrap().transactions
    }

    /// Number of live subscriptions across all clients.
    pub fn listener_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.value_listeners.len() + inner.child_listeners.len()
    }
}

/// One client connection to a [`MockStore`].
#[derive(Clone)]
pub struct MockStoreClient {
    id: u64,
    inner: Arc<Mutex<MockStoreInner>>,
}

impl MockStoreClient {
    /// Client identifier, unique within the store.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Paths with a deferred mutation registered by this client.
    pub fn deferred_paths(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .deferred
            .get(&self.id)
            .map(|deferred| deferred.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate the connection vanishing: run deferred mutations, drop this
    /// client's listeners and fail all further operations.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.disconnected.insert(self.id) {
            return;
        }

        let id = self.id;
        inner.value_listeners.retain(|l| l.client_id != id);
        inner.child_listeners.retain(|l| l.client_id != id);

        let deferred = inner.deferred.remove(&id).unwrap_or_default();
        for (path, mutation) in deferred {
            match mutation {
                DeferredMutation::Remove => inner.set(&path, None),
                DeferredMutation::Set(value) => inner.set(&path, Some(value)),
            }
        }
    }

    /// Whether [`MockStoreClient::disconnect`] was called.
    pub fn is_disconnected(&self) -> bool {
        self.inner.lock().unwrap().disconnected.contains(&self.id)
    }

    fn unsubscribe_fn(&self, listener_id: u64) -> impl FnOnce() + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                let mut inner = inner.lock().unwrap();
                inner.value_listeners.retain(|l| l.id != listener_id);
                inner.child_listeners.retain(|l| l.id != listener_id);
            }
        }
    }
}

#[async_trait::async_trait]
impl SignalingStore for MockStoreClient {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        validate_path(path)?;
        let inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        Ok(inner.get(path).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        if inner.fail_writes {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        inner.set(path, Some(value));
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        if inner.fail_writes {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        let mut merged = inner
            .get(path)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (key, value) in fields {
            merged.insert(key, value);
        }
        inner.set(path, Some(Value::Object(merged)));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        if inner.fail_deletes {
            return Err(StoreError::Backend("injected delete failure".to_string()));
        }
        inner.set(path, None);
        Ok(())
    }

    async fn transact(
        &self,
        path: &str,
        mut apply: TransactionFn,
    ) -> Result<TransactionOutcome, StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        inner.transactions += 1;

        let current = inner.get(path).cloned();
        match apply(current.as_ref()) {
            TransactionDecision::Commit(value) => {
                inner.set(path, value);
                Ok(TransactionOutcome {
                    committed: true,
                    value: inner.get(path).cloned(),
                })
            }
            TransactionDecision::Abort => Ok(TransactionOutcome {
                committed: false,
                value: current,
            }),
        }
    }

    async fn append_unique(&self, path: &str, value: Value) -> Result<String, StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        if inner.fail_writes {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        inner.next_append += 1;
        let key = format!("{:020}", inner.next_append);
        inner.set(&format!("{path}/{key}"), Some(value));
        Ok(key)
    }

    async fn on_value_changed(
        &self,
        path: &str,
        listener: Listener,
    ) -> Result<Subscription, StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;

        inner.next_listener_id += 1;
        let id = inner.next_listener_id;
        let current = inner.get(path).cloned();
        inner.value_listeners.push(ValueListener {
            id,
            client_id: self.id,
            path: path.to_string(),
            listener: Arc::clone(&listener),
            last: current.clone(),
        });

        listener(StoreEvent {
            path: path.to_string(),
            key: None,
            value: current,
        });

        Ok(Subscription::new(path, self.unsubscribe_fn(id)))
    }

    async fn on_child_appended(
        &self,
        path: &str,
        listener: Listener,
    ) -> Result<Subscription, StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;

        inner.next_listener_id += 1;
        let id = inner.next_listener_id;
        let existing = inner.child_keys(path);
        for key in &existing {
            listener(StoreEvent {
                path: path.to_string(),
                key: Some(key.clone()),
                value: inner.get(&format!("{path}/{key}")).cloned(),
            });
        }
        inner.child_listeners.push(ChildListener {
            id,
            client_id: self.id,
            path: path.to_string(),
            listener,
            known: existing,
        });

        Ok(Subscription::new(path, self.unsubscribe_fn(id)))
    }

    async fn defer_on_disconnect(
        &self,
        path: &str,
        mutation: DeferredMutation,
    ) -> Result<(), StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        if inner.fail_defers {
            return Err(StoreError::Backend(format!("injected defer failure at {path}")));
        }
        inner
            .deferred
            .entry(self.id)
            .or_default()
            .insert(path.to_string(), mutation);
        Ok(())
    }

    async fn cancel_deferred(&self, path: &str) -> Result<(), StoreError> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.check_client(self.id)?;
        if let Some(deferred) = inner.deferred.get_mut(&self.id) {
            deferred.remove(path);
        }
        Ok(())
    }
}
