use crate::error::Error;
use crate::protocol::{Operation, SequencedMessage, MESSAGE_TYPE_OPERATION};
use crate::runtime::{
    ChannelStorage, ContainerRuntime, SharedObject, Tree, UNATTACHED_CLIENT_SEQ,
};
use crate::types::directory::SharedDirectory;
use crate::types::map::SharedMap;
use crate::value::{ValueOpEmitter, ValueOpHandler, ValueType, ValueTypeInstance};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value as Json};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Host-runtime double: assigns client sequence numbers, captures everything a container
/// submits, and resolves handles against a registry of known objects.
pub(crate) struct TestRuntime {
    pub client_id: String,
    attached: AtomicBool,
    next_client_seq: AtomicI64,
    submitted: Mutex<Vec<(i64, Operation)>>,
    bound: Mutex<Vec<String>>,
    objects: Mutex<HashMap<String, Arc<dyn SharedObject>>>,
}

impl TestRuntime {
    pub fn new(client_id: &str) -> Arc<Self> {
        Arc::new(TestRuntime {
            client_id: client_id.to_string(),
            attached: AtomicBool::new(true),
            next_client_seq: AtomicI64::new(1),
            submitted: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
        })
    }

    pub fn detached(client_id: &str) -> Arc<Self> {
        let runtime = Self::new(client_id);
        runtime.attached.store(false, Ordering::SeqCst);
        runtime
    }

    pub fn attach(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    pub fn register_object(&self, url: &str, object: Arc<dyn SharedObject>) {
        self.objects.lock().unwrap().insert(url.to_string(), object);
    }

    /// Drains the operations submitted since the last call, in submission order.
    pub fn take_submitted(&self) -> Vec<(i64, Operation)> {
        std::mem::take(&mut *self.submitted.lock().unwrap())
    }

    pub fn bound_handles(&self) -> Vec<String> {
        self.bound.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for TestRuntime {
    fn submit_local_message(&self, op: &Operation) -> i64 {
        if !self.attached.load(Ordering::SeqCst) {
            return UNATTACHED_CLIENT_SEQ;
        }
        let client_seq = self.next_client_seq.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push((client_seq, op.clone()));
        client_seq
    }

    fn attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    async fn resolve_handle(&self, url: &str) -> Result<Arc<dyn SharedObject>, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::UnresolvedHandle(url.to_string()))
    }

    fn bind_handle(&self, url: &str) {
        self.bound.lock().unwrap().push(url.to_string());
    }
}

/// Assigns server sequence numbers, standing in for the ordering service.
pub(crate) struct Sequencer {
    next_seq: i64,
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer { next_seq: 1 }
    }

    pub fn message(&mut self, client_id: &str, client_seq: i64, op: Operation) -> SequencedMessage {
        let sequence_number = self.next_seq;
        self.next_seq += 1;
        SequencedMessage {
            client_sequence_number: client_seq,
            reference_sequence_number: 0,
            sequence_number,
            client_id: client_id.to_string(),
            message_type: MESSAGE_TYPE_OPERATION.to_string(),
            contents: op,
        }
    }
}

/// Sequences everything `from` has submitted and delivers it to every replica, flagging the
/// originating replica's copy as local.
pub(crate) async fn deliver_map(
    sequencer: &mut Sequencer,
    from: &TestRuntime,
    replicas: &[(&SharedMap, &TestRuntime)],
) {
    for (client_seq, op) in from.take_submitted() {
        let message = sequencer.message(&from.client_id, client_seq, op);
        for (map, runtime) in replicas {
            let local = runtime.client_id == from.client_id;
            map.process_message(&message, local).await.unwrap();
        }
    }
}

/// [deliver_map] for directory replicas.
pub(crate) async fn deliver_directory(
    sequencer: &mut Sequencer,
    from: &TestRuntime,
    replicas: &[(&SharedDirectory, &TestRuntime)],
) {
    for (client_seq, op) in from.take_submitted() {
        let message = sequencer.message(&from.client_id, client_seq, op);
        for (directory, runtime) in replicas {
            let local = runtime.client_id == from.client_id;
            directory.process_message(&message, local).await.unwrap();
        }
    }
}

/// Blob-storage double backed by a name → base64 map.
pub(crate) struct TestStorage {
    blobs: HashMap<String, String>,
}

impl TestStorage {
    pub fn from_tree(tree: &Tree) -> Self {
        let blobs = tree
            .entries
            .iter()
            .map(|e| (e.path.clone(), BASE64.encode(&e.value.contents)))
            .collect();
        TestStorage { blobs }
    }

    pub fn with_blob(name: &str, contents: String) -> Self {
        let mut blobs = HashMap::new();
        blobs.insert(name.to_string(), BASE64.encode(contents));
        TestStorage { blobs }
    }
}

#[async_trait]
impl ChannelStorage for TestStorage {
    async fn read(&self, name: &str) -> Result<String, Error> {
        self.blobs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingBlob(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }
}

/// A shared monotonic counter: the simplest useful value type. Mutations go through the op log
/// as `act` operations named `increment`.
pub(crate) struct Counter {
    value: AtomicI64,
    emitter: ValueOpEmitter,
}

impl Counter {
    /// Applies the increment locally and reports it through the emitter.
    pub fn increment(&self, amount: i64) {
        let previous = self.value.fetch_add(amount, Ordering::SeqCst);
        self.emitter.emit("increment", json!(previous), json!(amount));
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl ValueTypeInstance for Counter {
    fn store(&self) -> Json {
        json!(self.value.load(Ordering::SeqCst))
    }

    fn op_handler(&self, op_name: &str) -> Option<Arc<dyn ValueOpHandler>> {
        match op_name {
            "increment" => Some(Arc::new(IncrementHandler)),
            _ => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct IncrementHandler;

#[async_trait]
impl ValueOpHandler for IncrementHandler {
    fn process(
        &self,
        value: &dyn ValueTypeInstance,
        params: &Json,
        _context: crate::value::OpContext,
        _local: bool,
        _message: Option<&SequencedMessage>,
    ) {
        if let Some(counter) = value.as_any().downcast_ref::<Counter>() {
            counter
                .value
                .fetch_add(params.as_i64().unwrap_or(0), Ordering::SeqCst);
        }
    }
}

pub(crate) struct CounterType;

impl ValueType for CounterType {
    fn name(&self) -> &str {
        "counter"
    }

    fn load(
        &self,
        params: &Json,
        emitter: ValueOpEmitter,
    ) -> Result<Arc<dyn ValueTypeInstance>, Error> {
        Ok(Arc::new(Counter {
            value: AtomicI64::new(params.as_i64().unwrap_or(0)),
            emitter,
        }))
    }
}
