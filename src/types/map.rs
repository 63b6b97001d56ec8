use crate::error::Error;
use crate::kernel::{Applied, MapKernel};
use crate::observer::Subscription;
use crate::protocol::{Operation, SequencedMessage, SerializableValue, ValueTypeOp};
use crate::runtime::{
    Attributes, ChannelStorage, ContainerRuntime, SharedHandle, SharedObject, Tree,
    MAP_SNAPSHOT_FORMAT_VERSION, MAP_TYPE_URI,
};
use crate::snapshot;
use crate::types::{ChannelEvents, ClearEvent, PendingLocalMessage, ValueChangedEvent};
use crate::value::{
    ActChannel, LocalValue, OpContext, ValueOpEmitter, ValueTypeInstance, ValueTypeRegistry,
};
use atomic_refcell::AtomicRefCell;
use serde_json::Value as Json;
use std::collections::VecDeque;
use std::fmt::Formatter;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) struct MapInner {
    id: String,
    runtime: Arc<dyn ContainerRuntime>,
    registry: ValueTypeRegistry,
    kernel: AtomicRefCell<MapKernel>,
    pending: AtomicRefCell<VecDeque<PendingLocalMessage>>,
    events: ChannelEvents,
}

/// A flat, collaborative key-value container.
///
/// Local mutations apply optimistically and are submitted to the ordering service; the sequenced
/// echoes coming back on the delta stream, together with every other replica's operations, drive
/// [SharedMap::process_message]. Replicas that have ingested the same prefix of the stream and
/// have no operations in flight hold identical entries: convergence is last-writer-wins per key
/// in total-order terms, with local unacknowledged writes shadowing remote ones until their
/// echoes arrive.
///
/// The facade is cheap to clone; clones share one kernel.
#[derive(Clone)]
pub struct SharedMap {
    inner: Arc<MapInner>,
}

fn validate_key(key: &str) -> Result<(), Error> {
    if key.is_empty() {
        Err(Error::InvalidKey)
    } else {
        Ok(())
    }
}

impl SharedMap {
    /// Creates an empty, detached map. The map starts submitting operations once the runtime
    /// reports itself attached; anything issued before that is queued and re-driven by
    /// [SharedMap::connect].
    pub fn new<S: Into<String>>(
        id: S,
        runtime: Arc<dyn ContainerRuntime>,
        registry: ValueTypeRegistry,
    ) -> Self {
        SharedMap {
            inner: Arc::new(MapInner {
                id: id.into(),
                runtime,
                registry,
                kernel: AtomicRefCell::new(MapKernel::new()),
                pending: AtomicRefCell::new(VecDeque::new()),
                events: ChannelEvents::default(),
            }),
        }
    }

    /// Restores a map from a snapshot previously produced by [SharedMap::snapshot].
    pub async fn load<S: Into<String>>(
        id: S,
        runtime: Arc<dyn ContainerRuntime>,
        registry: ValueTypeRegistry,
        storage: &dyn ChannelStorage,
    ) -> Result<Self, Error> {
        let map = SharedMap::new(id, runtime, registry);
        for (key, serializable) in snapshot::load_map(storage).await? {
            let emitter = map.inner.emitter(&key, &serializable.value_type);
            let value = map.inner.registry.from_serializable(&serializable, emitter)?;
            map.inner.kernel.borrow_mut().set_local(key, value);
        }
        Ok(map)
    }

    /// Retrieves the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<LocalValue> {
        self.inner.kernel.borrow().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.kernel.borrow().has(key)
    }

    pub fn len(&self) -> usize {
        self.inner.kernel.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in insertion order. The order is a single-replica convenience, not replicated state.
    pub fn keys(&self) -> Vec<String> {
        self.inner.kernel.borrow().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<LocalValue> {
        self.inner
            .kernel
            .borrow()
            .entries()
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(String, LocalValue)> {
        self.inner
            .kernel
            .borrow()
            .entries()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn for_each<F: FnMut(&LocalValue, &str)>(&self, mut f: F) {
        for (key, value) in self.entries() {
            f(&value, &key);
        }
    }

    /// Stores a plain JSON value under `key`, applying locally and submitting a `set`.
    pub fn set<V: Into<Json>>(&self, key: &str, value: V) -> Result<(), Error> {
        validate_key(key)?;
        self.set_value(key, LocalValue::Plain(value.into()))
    }

    /// Stores a handle reference to another shared object under `key`.
    pub fn set_handle(&self, key: &str, handle: SharedHandle) -> Result<(), Error> {
        validate_key(key)?;
        if self.inner.runtime.attached() {
            self.inner.runtime.bind_handle(&handle.url);
        }
        self.set_value(key, LocalValue::Shared(handle))
    }

    /// Creates a value of a registered value type under `key`, returning the live instance.
    /// Mutations made through the instance flow through the log as `act` operations.
    pub fn create_value_type(
        &self,
        key: &str,
        type_name: &str,
        params: Json,
    ) -> Result<Arc<dyn ValueTypeInstance>, Error> {
        validate_key(key)?;
        if !self.inner.registry.contains(type_name) {
            return Err(Error::UnknownValueType(type_name.to_string()));
        }
        let serializable = SerializableValue {
            value_type: type_name.to_string(),
            value: params,
        };
        let emitter = self.inner.emitter(key, type_name);
        let value = self.inner.registry.from_serializable(&serializable, emitter)?;
        let instance = match &value {
            LocalValue::ValueType(v) => v.instance().clone(),
            _ => return Err(Error::UnknownValueType(type_name.to_string())),
        };
        self.set_value(key, value)?;
        Ok(instance)
    }

    fn set_value(&self, key: &str, value: LocalValue) -> Result<(), Error> {
        let serializable = value.make_serializable();
        let previous = self
            .inner
            .kernel
            .borrow_mut()
            .set_local(key.to_string(), value);
        self.inner.events.value_changed.trigger(
            &ValueChangedEvent {
                key: key.to_string(),
                previous_value: previous.map(|v| v.make_serializable()),
                path: None,
            },
            true,
            None,
        );
        let client_seq = self.inner.submit(Operation::Set {
            key: key.to_string(),
            path: None,
            value: serializable,
        });
        self.inner.kernel.borrow_mut().mark_pending_key(key, client_seq);
        Ok(())
    }

    /// Deletes `key`, returning whether it existed locally at the time of the call.
    pub fn delete(&self, key: &str) -> bool {
        let previous = self.inner.kernel.borrow_mut().delete_local(key);
        let existed = previous.is_some();
        self.inner.events.value_changed.trigger(
            &ValueChangedEvent {
                key: key.to_string(),
                previous_value: previous.map(|v| v.make_serializable()),
                path: None,
            },
            true,
            None,
        );
        let client_seq = self.inner.submit(Operation::Delete {
            key: key.to_string(),
            path: None,
        });
        self.inner.kernel.borrow_mut().mark_pending_key(key, client_seq);
        existed
    }

    /// Wipes all keys. Until the echo arrives, every inbound key operation is masked: a clear
    /// supersedes everything that was in flight before it.
    pub fn clear(&self) {
        self.inner.kernel.borrow_mut().clear_local();
        self.inner
            .events
            .clear
            .trigger(&ClearEvent { path: None }, true, None);
        let client_seq = self.inner.submit(Operation::Clear { path: None });
        self.inner.kernel.borrow_mut().mark_pending_clear(client_seq);
    }

    /// Resolves with the value under `key`: immediately when present, otherwise when the next
    /// matching `valueChanged` fires. No timeout; cancel by dropping the future.
    pub async fn wait(&self, key: &str) -> LocalValue {
        loop {
            // subscribe before checking, so a concurrent set cannot slip between the two
            let (tx, rx) = oneshot::channel();
            let tx = Mutex::new(Some(tx));
            let wanted = key.to_string();
            let _sub = self.inner.events.value_changed.subscribe(move |e, _, _| {
                if e.key == wanted {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                }
            });
            if let Some(value) = self.get(key) {
                return value;
            }
            let _ = rx.await;
        }
    }

    /// Ingests one sequenced message addressed to this map.
    ///
    /// The prepare phase (the only suspension point) materializes whatever the operation
    /// carries; processing is synchronous. A returned error means the message was skipped with
    /// no state change; reconciliation skips never error.
    pub async fn process_message(
        &self,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<(), Error> {
        self.inner.events.pre_op.trigger(message, local, Some(message));
        let context = self.inner.prepare(message, local).await?;
        self.inner.process(message, local, context);
        self.inner.events.op.trigger(message, local, Some(message));
        Ok(())
    }

    /// Re-drives outstanding local operations after the container connects (or reconnects).
    /// Fresh client sequence numbers are assigned and the pending markers rebuilt, so replayed
    /// echoes reconcile exactly like first-time ones.
    pub fn connect(&self) {
        let outstanding: Vec<PendingLocalMessage> =
            self.inner.pending.borrow_mut().drain(..).collect();
        self.inner.kernel.borrow_mut().reset_pending();
        for message in outstanding {
            self.inner.resubmit(message.op);
        }
    }

    /// Registers every handle held as a value with the host runtime. Called by the host when
    /// the container itself is attached, so child objects attach together with their parent.
    pub fn bind_handles(&self) {
        let urls: Vec<String> = self
            .inner
            .kernel
            .borrow()
            .entries()
            .filter_map(|(_, v)| v.as_handle().map(|h| h.url.clone()))
            .collect();
        for url in urls {
            self.inner.runtime.bind_handle(&url);
        }
    }

    /// Serializes the full map state into a partitioned blob tree.
    pub fn snapshot(&self) -> Result<Tree, Error> {
        let entries: Vec<(String, SerializableValue)> = self
            .inner
            .kernel
            .borrow()
            .entries()
            .map(|(k, v)| (k.clone(), v.make_serializable()))
            .collect();
        snapshot::serialize_map(entries)
    }

    /// Subscribes a callback to `valueChanged`. Returns a [Subscription] which unsubscribes
    /// when dropped.
    pub fn observe_value_changed<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ValueChangedEvent, bool, Option<&SequencedMessage>) + Send + Sync + 'static,
    {
        self.inner.events.value_changed.subscribe(f)
    }

    /// Subscribes a callback to `clear`.
    pub fn observe_clear<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ClearEvent, bool, Option<&SequencedMessage>) + Send + Sync + 'static,
    {
        self.inner.events.clear.subscribe(f)
    }

    /// Subscribes a callback to `pre-op`, fired before a sequenced message mutates state.
    pub fn observe_pre_op<F>(&self, f: F) -> Subscription
    where
        F: Fn(&SequencedMessage, bool, Option<&SequencedMessage>) + Send + Sync + 'static,
    {
        self.inner.events.pre_op.subscribe(f)
    }

    /// Subscribes a callback to `op`, fired after a sequenced message was fully processed.
    pub fn observe_op<F>(&self, f: F) -> Subscription
    where
        F: Fn(&SequencedMessage, bool, Option<&SequencedMessage>) + Send + Sync + 'static,
    {
        self.inner.events.op.subscribe(f)
    }

    #[cfg(test)]
    pub(crate) fn kernel(&self) -> atomic_refcell::AtomicRef<'_, MapKernel> {
        self.inner.kernel.borrow()
    }

    #[cfg(test)]
    pub(crate) fn pending_message_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }
}

impl SharedObject for SharedMap {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn type_uri(&self) -> &'static str {
        MAP_TYPE_URI
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            channel_type: MAP_TYPE_URI.to_string(),
            snapshot_format_version: MAP_SNAPSHOT_FORMAT_VERSION.to_string(),
        }
    }

    fn handle(&self) -> SharedHandle {
        SharedHandle::new(self.inner.id.clone())
    }
}

impl std::fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kernel = self.inner.kernel.borrow();
        let mut s = f.debug_struct(&self.inner.id);
        for (key, value) in kernel.entries() {
            s.field(key, value);
        }
        s.finish()
    }
}

impl MapInner {
    fn submit(&self, op: Operation) -> i64 {
        let client_seq = self.runtime.submit_local_message(&op);
        self.pending.borrow_mut().push_back(PendingLocalMessage {
            client_sequence_number: client_seq,
            op,
        });
        client_seq
    }

    fn ack(&self, client_seq: i64) {
        self.pending
            .borrow_mut()
            .retain(|m| m.client_sequence_number != client_seq);
    }

    fn resubmit(&self, op: Operation) {
        enum Marker {
            Key(String),
            Clear,
            None,
        }
        let marker = match &op {
            Operation::Set { key, .. } | Operation::Delete { key, .. } => Marker::Key(key.clone()),
            Operation::Clear { .. } => Marker::Clear,
            _ => Marker::None,
        };
        let client_seq = self.submit(op);
        let mut kernel = self.kernel.borrow_mut();
        match marker {
            Marker::Key(key) => kernel.mark_pending_key(&key, client_seq),
            Marker::Clear => kernel.mark_pending_clear(client_seq),
            Marker::None => {}
        }
    }

    fn emitter(self: &Arc<Self>, key: &str, type_name: &str) -> ValueOpEmitter {
        let concrete: Weak<Self> = Arc::downgrade(self);
        let weak: Weak<dyn ActChannel> = concrete;
        ValueOpEmitter::new(type_name, key, None, weak)
    }

    async fn prepare(
        self: &Arc<Self>,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<OpContext, Error> {
        match &message.contents {
            Operation::Set { key, value, .. } if !local => {
                let emitter = self.emitter(key, &value.value_type);
                let value = self.registry.from_serializable(value, emitter)?;
                Ok(Some(Box::new(value)))
            }
            Operation::Act { key, value: op, .. } if !local => {
                if self.kernel.borrow().has_pending_clear() {
                    return Ok(None);
                }
                let value = {
                    let kernel = self.kernel.borrow();
                    match kernel.get(key).and_then(|v| v.as_value_type().cloned()) {
                        Some(v) => v,
                        None => return Err(Error::NotAValueType(key.clone())),
                    }
                };
                let handler = value
                    .instance()
                    .op_handler(&op.op_name)
                    .ok_or_else(|| Error::UnknownValueOperation(op.op_name.clone()))?;
                handler
                    .prepare(value.instance().as_ref(), &op.value, local, Some(message))
                    .await
            }
            _ => Ok(None),
        }
    }

    fn process(&self, message: &SequencedMessage, local: bool, context: OpContext) {
        if local {
            self.ack(message.client_sequence_number);
        }
        let client_seq = message.client_sequence_number;
        match &message.contents {
            Operation::Set { key, .. } => {
                let value = context.and_then(|c| c.downcast::<LocalValue>().ok());
                let applied = {
                    let mut kernel = self.kernel.borrow_mut();
                    if kernel.needs_process_key(key, local, client_seq) {
                        value.map(|v| kernel.process_set(key.clone(), *v))
                    } else {
                        None
                    }
                };
                if let Some(Applied::Key { key, previous }) = applied {
                    self.events.value_changed.trigger(
                        &ValueChangedEvent {
                            key,
                            previous_value: previous.map(|v| v.make_serializable()),
                            path: None,
                        },
                        local,
                        Some(message),
                    );
                }
            }
            Operation::Delete { key, .. } => {
                let applied = {
                    let mut kernel = self.kernel.borrow_mut();
                    if kernel.needs_process_key(key, local, client_seq) {
                        Some(kernel.process_delete(key))
                    } else {
                        None
                    }
                };
                if let Some(Applied::Key { key, previous }) = applied {
                    self.events.value_changed.trigger(
                        &ValueChangedEvent {
                            key,
                            previous_value: previous.map(|v| v.make_serializable()),
                            path: None,
                        },
                        local,
                        Some(message),
                    );
                }
            }
            Operation::Clear { .. } => {
                let applied = self.kernel.borrow_mut().process_clear(local, client_seq);
                if applied == Applied::Cleared {
                    self.events
                        .clear
                        .trigger(&ClearEvent { path: None }, local, Some(message));
                }
            }
            Operation::Act { key, value: op, .. } => {
                if local {
                    // already applied when the instance mutated itself at emit time
                    return;
                }
                if self.kernel.borrow().has_pending_clear() {
                    return;
                }
                let value = {
                    let kernel = self.kernel.borrow();
                    kernel.get(key).and_then(|v| v.as_value_type().cloned())
                };
                let value = match value {
                    Some(v) => v,
                    None => {
                        debug!(key = %key, "dropping act targeting a non-value-type key");
                        return;
                    }
                };
                let handler = match value.instance().op_handler(&op.op_name) {
                    Some(h) => h,
                    None => {
                        debug!(op_name = %op.op_name, "dropping act with no handler");
                        return;
                    }
                };
                let previous = SerializableValue {
                    value_type: value.type_name().to_string(),
                    value: value.instance().store(),
                };
                handler.process(value.instance().as_ref(), &op.value, context, local, Some(message));
                self.events.value_changed.trigger(
                    &ValueChangedEvent {
                        key: key.clone(),
                        previous_value: Some(previous),
                        path: None,
                    },
                    local,
                    Some(message),
                );
            }
            Operation::CreateSubDirectory { .. } | Operation::DeleteSubDirectory { .. } => {
                debug!(op = %message.contents, "ignoring directory operation on a flat map");
            }
            Operation::Unknown => {
                debug!("ignoring unrecognized operation type");
            }
        }
    }
}

impl ActChannel for MapInner {
    fn emit_act(
        &self,
        key: &str,
        _path: Option<&str>,
        previous: SerializableValue,
        op: ValueTypeOp,
    ) {
        self.submit(Operation::Act {
            key: key.to_string(),
            path: None,
            value: op,
        });
        self.events.value_changed.trigger(
            &ValueChangedEvent {
                key: key.to_string(),
                previous_value: Some(previous),
                path: None,
            },
            true,
            None,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{deliver_map, Counter, CounterType, Sequencer, TestRuntime, TestStorage};
    use serde_json::json;

    fn new_map(client: &str) -> (SharedMap, Arc<TestRuntime>) {
        let runtime = TestRuntime::new(client);
        let mut registry = ValueTypeRegistry::new();
        registry.register(Arc::new(CounterType));
        let map = SharedMap::new("map-1", runtime.clone() as Arc<dyn ContainerRuntime>, registry);
        (map, runtime)
    }

    fn plain(v: Json) -> LocalValue {
        LocalValue::Plain(v)
    }

    #[test]
    fn set_is_visible_immediately() {
        let (map, _runtime) = new_map("a");
        map.set("k", json!("v")).unwrap();
        assert_eq!(map.get("k"), Some(plain(json!("v"))));
        assert!(map.has("k"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn empty_key_is_rejected() {
        let (map, _runtime) = new_map("a");
        assert!(matches!(map.set("", json!(1)), Err(Error::InvalidKey)));
        assert!(matches!(
            map.create_value_type("", "counter", json!(0)),
            Err(Error::InvalidKey)
        ));
    }

    #[test]
    fn delete_reports_prior_existence() {
        let (map, _runtime) = new_map("a");
        map.set("k", json!(1)).unwrap();
        assert!(map.delete("k"));
        assert!(!map.delete("k"));
        assert!(!map.has("k"));
    }

    #[tokio::test]
    async fn local_set_shadows_earlier_remote_set() {
        let mut sequencer = Sequencer::new();
        let (map, runtime) = new_map("a");

        map.set("k", json!("A")).unwrap();
        let submitted = runtime.take_submitted();
        assert_eq!(submitted.len(), 1);
        let (client_seq, op) = submitted.into_iter().next().unwrap();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        let _sub = map.observe_value_changed(move |e, local, _| {
            seen.lock().unwrap().push((e.key.clone(), local));
        });

        // a remote write sequenced before our echo must not clobber the optimistic value
        let remote = sequencer.message(
            "b",
            1,
            Operation::Set {
                key: "k".to_string(),
                path: None,
                value: SerializableValue::plain(json!("B")),
            },
        );
        map.process_message(&remote, false).await.unwrap();
        assert_eq!(map.get("k"), Some(plain(json!("A"))));
        assert!(changes.lock().unwrap().is_empty());

        // our echo retires the pending entry; later remote writes apply again
        let echo = sequencer.message("a", client_seq, op);
        map.process_message(&echo, true).await.unwrap();
        assert_eq!(map.get("k"), Some(plain(json!("A"))));
        assert_eq!(map.kernel().pending_len(), 0);
        assert_eq!(map.pending_message_count(), 0);

        let remote = sequencer.message(
            "b",
            2,
            Operation::Set {
                key: "k".to_string(),
                path: None,
                value: SerializableValue::plain(json!("C")),
            },
        );
        map.process_message(&remote, false).await.unwrap();
        assert_eq!(map.get("k"), Some(plain(json!("C"))));
        assert_eq!(&*changes.lock().unwrap(), &[("k".to_string(), false)]);
    }

    #[tokio::test]
    async fn clear_masks_everything_in_flight() {
        let mut sequencer = Sequencer::new();
        let (map, runtime) = new_map("a");

        map.set("a", json!(1)).unwrap();
        map.clear();
        assert!(map.is_empty());
        let submitted = runtime.take_submitted();

        // a remote write sequenced between our operations is masked by the outstanding clear
        let remote = sequencer.message(
            "b",
            1,
            Operation::Set {
                key: "a".to_string(),
                path: None,
                value: SerializableValue::plain(json!(2)),
            },
        );
        map.process_message(&remote, false).await.unwrap();
        assert!(map.is_empty());

        for (client_seq, op) in submitted {
            let echo = sequencer.message("a", client_seq, op);
            map.process_message(&echo, true).await.unwrap();
        }
        assert!(map.is_empty());
        assert_eq!(map.kernel().pending_len(), 0);

        // once the clear round-tripped, remote writes resume applying
        let remote = sequencer.message(
            "b",
            2,
            Operation::Set {
                key: "a".to_string(),
                path: None,
                value: SerializableValue::plain(json!(3)),
            },
        );
        map.process_message(&remote, false).await.unwrap();
        assert_eq!(map.get("a"), Some(plain(json!(3))));
    }

    #[tokio::test]
    async fn replicas_converge() {
        let mut sequencer = Sequencer::new();
        let (map_a, runtime_a) = new_map("a");
        let (map_b, runtime_b) = new_map("b");
        let replicas = [(&map_a, &*runtime_a), (&map_b, &*runtime_b)];

        map_a.set("x", json!(1)).unwrap();
        map_a.set("y", json!("one")).unwrap();
        map_b.set("x", json!(2)).unwrap();
        map_b.delete("y");

        deliver_map(&mut sequencer, &runtime_a, &replicas).await;
        deliver_map(&mut sequencer, &runtime_b, &replicas).await;

        assert_eq!(map_a.entries(), map_b.entries());
        // b's operations were sequenced last and win
        assert_eq!(map_a.get("x"), Some(plain(json!(2))));
        assert!(!map_a.has("y"));
        assert_eq!(map_a.kernel().pending_len(), 0);
        assert_eq!(map_b.kernel().pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_remote_delivery_is_idempotent() {
        let mut sequencer = Sequencer::new();
        let (map, _runtime) = new_map("a");

        let remote = sequencer.message(
            "b",
            1,
            Operation::Set {
                key: "k".to_string(),
                path: None,
                value: SerializableValue::plain(json!(9)),
            },
        );
        map.process_message(&remote, false).await.unwrap();
        let once = map.entries();
        map.process_message(&remote, false).await.unwrap();
        assert_eq!(map.entries(), once);
    }

    #[tokio::test]
    async fn unknown_remote_op_is_ignored() {
        let mut sequencer = Sequencer::new();
        let (map, _runtime) = new_map("a");
        map.set("k", json!(1)).unwrap();

        let message = sequencer.message("b", 1, Operation::Unknown);
        map.process_message(&message, false).await.unwrap();
        assert_eq!(map.get("k"), Some(plain(json!(1))));
    }

    #[tokio::test]
    async fn wait_resolves_on_later_set() {
        let (map, _runtime) = new_map("a");
        let waiter = map.clone();
        let (value, _) = tokio::join!(waiter.wait("pending"), async {
            map.set("other", json!(0)).unwrap();
            map.set("pending", json!("here")).unwrap();
        });
        assert_eq!(value, plain(json!("here")));
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_present() {
        let (map, _runtime) = new_map("a");
        map.set("k", json!(5)).unwrap();
        assert_eq!(map.wait("k").await, plain(json!(5)));
    }

    #[tokio::test]
    async fn counter_converges_without_double_apply() {
        let mut sequencer = Sequencer::new();
        let (map_a, runtime_a) = new_map("a");
        let (map_b, runtime_b) = new_map("b");
        let replicas = [(&map_a, &*runtime_a), (&map_b, &*runtime_b)];

        let counter = map_a.create_value_type("c", "counter", json!(0)).unwrap();
        deliver_map(&mut sequencer, &runtime_a, &replicas).await;

        let counter = counter.as_any().downcast_ref::<Counter>().unwrap();
        counter.increment(5);
        assert_eq!(counter.value(), 5);
        deliver_map(&mut sequencer, &runtime_a, &replicas).await;

        // the local echo must not re-apply the increment
        assert_eq!(counter.value(), 5);
        let remote = map_b.get("c").unwrap();
        let remote = remote.as_value_type().unwrap().instance().clone();
        assert_eq!(remote.as_any().downcast_ref::<Counter>().unwrap().value(), 5);

        // increments are operational, so concurrent ones combine instead of clobbering
        remote.as_any().downcast_ref::<Counter>().unwrap().increment(2);
        counter.increment(1);
        deliver_map(&mut sequencer, &runtime_b, &replicas).await;
        deliver_map(&mut sequencer, &runtime_a, &replicas).await;
        assert_eq!(counter.value(), 8);
        assert_eq!(map_a.entries(), map_b.entries());
    }

    #[tokio::test]
    async fn detached_operations_resubmit_on_connect() {
        let mut sequencer = Sequencer::new();
        let runtime = TestRuntime::detached("a");
        let map = SharedMap::new(
            "map-1",
            runtime.clone() as Arc<dyn ContainerRuntime>,
            ValueTypeRegistry::new(),
        );

        map.set("k", json!(1)).unwrap();
        map.set("j", json!(2)).unwrap();
        assert!(runtime.take_submitted().is_empty());
        assert_eq!(map.pending_message_count(), 2);

        runtime.attach();
        map.connect();
        let submitted = runtime.take_submitted();
        assert_eq!(submitted.len(), 2);

        // echoes of the replayed operations retire all pending state
        for (client_seq, op) in submitted {
            let echo = sequencer.message("a", client_seq, op);
            map.process_message(&echo, true).await.unwrap();
        }
        assert_eq!(map.pending_message_count(), 0);
        assert_eq!(map.kernel().pending_len(), 0);
        assert_eq!(map.get("k"), Some(plain(json!(1))));
    }

    #[tokio::test]
    async fn events_fire_in_processing_order() {
        let mut sequencer = Sequencer::new();
        let (map, _runtime) = new_map("a");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let _pre = map.observe_pre_op(move |_, _, _| o.lock().unwrap().push("pre-op"));
        let o = order.clone();
        let _vc = map.observe_value_changed(move |_, _, _| o.lock().unwrap().push("valueChanged"));
        let o = order.clone();
        let _op = map.observe_op(move |_, _, _| o.lock().unwrap().push("op"));

        let remote = sequencer.message(
            "b",
            1,
            Operation::Set {
                key: "k".to_string(),
                path: None,
                value: SerializableValue::plain(json!(1)),
            },
        );
        map.process_message(&remote, false).await.unwrap();
        assert_eq!(&*order.lock().unwrap(), &["pre-op", "valueChanged", "op"]);
    }

    #[tokio::test]
    async fn remote_set_of_unregistered_value_type_fails_prepare() {
        let mut sequencer = Sequencer::new();
        let runtime = TestRuntime::new("a");
        let map = SharedMap::new(
            "map-1",
            runtime.clone() as Arc<dyn ContainerRuntime>,
            ValueTypeRegistry::new(),
        );

        let remote = sequencer.message(
            "b",
            1,
            Operation::Set {
                key: "c".to_string(),
                path: None,
                value: SerializableValue {
                    value_type: "counter".to_string(),
                    value: json!(0),
                },
            },
        );
        let result = map.process_message(&remote, false).await;
        assert!(matches!(result, Err(Error::UnknownValueType(_))));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_storage() {
        let (map, _runtime) = new_map("a");
        map.set("plain", json!({"nested": true})).unwrap();
        map.set_handle("child", SharedHandle::new("other-object")).unwrap();
        map.create_value_type("count", "counter", json!(3)).unwrap();

        let tree = map.snapshot().unwrap();
        let storage = TestStorage::from_tree(&tree);
        let (restored, _runtime2) = {
            let runtime = TestRuntime::new("b");
            let mut registry = ValueTypeRegistry::new();
            registry.register(Arc::new(CounterType));
            (
                SharedMap::load("map-1", runtime.clone() as Arc<dyn ContainerRuntime>, registry, &storage)
                    .await
                    .unwrap(),
                runtime,
            )
        };
        assert_eq!(restored.entries(), map.entries());
    }

    #[tokio::test]
    async fn stored_handles_resolve_through_the_runtime() {
        let (map, runtime) = new_map("a");
        let (child, _child_runtime) = new_map("a");
        runtime.register_object("child-map", Arc::new(child.clone()));

        map.set_handle("child", child.handle()).unwrap();
        let handle = map.get("child").unwrap();
        let handle = handle.as_handle().unwrap();
        // container handles resolve by id
        assert_eq!(handle.url, "map-1");

        let registered = SharedHandle::new("child-map");
        let resolved = registered.get(&*runtime).await.unwrap();
        assert_eq!(resolved.id(), "map-1");
        assert_eq!(resolved.type_uri(), MAP_TYPE_URI);
        assert_eq!(
            resolved.attributes().snapshot_format_version,
            MAP_SNAPSHOT_FORMAT_VERSION
        );

        let missing = SharedHandle::new("nowhere");
        assert!(matches!(
            missing.get(&*runtime).await,
            Err(Error::UnresolvedHandle(_))
        ));
    }

    #[test]
    fn bind_handles_registers_children() {
        let (map, runtime) = new_map("a");
        map.set_handle("child", SharedHandle::new("other-object")).unwrap();
        map.set("plain", json!(1)).unwrap();
        map.bind_handles();
        // once at set time (attached) and once at bind time
        assert_eq!(runtime.bound_handles(), ["other-object", "other-object"]);
    }
}
