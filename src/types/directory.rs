use crate::error::Error;
use crate::kernel::{Applied, MapKernel};
use crate::observer::Subscription;
use crate::protocol::{Operation, SequencedMessage, SerializableValue, ValueTypeOp};
use crate::runtime::{
    Attributes, ChannelStorage, ContainerRuntime, SharedHandle, SharedObject, Tree,
    DIRECTORY_SNAPSHOT_FORMAT_VERSION, DIRECTORY_TYPE_URI,
};
use crate::snapshot::{self, DirectoryDataObject};
use crate::types::{ChannelEvents, ClearEvent, PendingLocalMessage, ValueChangedEvent};
use crate::utils::path::{self as path_util, ROOT_PATH};
use crate::value::{
    ActChannel, LocalValue, OpContext, ValueOpEmitter, ValueTypeInstance, ValueTypeRegistry,
};
use async_trait::async_trait;
use atomic_refcell::AtomicRefCell;
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::{HashMap, VecDeque};
use std::fmt::Formatter;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::debug;

/// One node of the directory tree: its own key storage and pending bookkeeping, plus the names
/// of its children. Nodes live in the owning tree's arena, keyed by their canonical absolute
/// path, which doubles as the node's stable identity.
struct DirNode {
    children: IndexMap<String, Arc<str>>,
    kernel: MapKernel,
    pending_subdirs: HashMap<String, i64>,
}

impl DirNode {
    fn new() -> Self {
        DirNode {
            children: IndexMap::new(),
            kernel: MapKernel::new(),
            pending_subdirs: HashMap::new(),
        }
    }

    /// Subdirectory analogue of the key reconciliation rule: a name with a locally-issued
    /// lifecycle operation in flight shadows remote lifecycle operations until the echo arrives.
    fn needs_process_subdir(&mut self, name: &str, local: bool, client_seq: i64) -> bool {
        if let Some(&pending) = self.pending_subdirs.get(name) {
            if local && pending == client_seq {
                self.pending_subdirs.remove(name);
            }
            return false;
        }
        !local
    }
}

/// Arena of directory nodes, keyed by canonical absolute path. The path doubles as the stable
/// node identifier, so handles never hold references into the tree.
struct DirTree {
    nodes: HashMap<Arc<str>, DirNode>,
}

impl DirTree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_PATH.into(), DirNode::new());
        DirTree { nodes }
    }

    fn node(&self, path: &str) -> Option<&DirNode> {
        self.nodes.get(path)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut DirNode> {
        self.nodes.get_mut(path)
    }

    /// Creates the named child under `parent` if it does not exist yet, returning its absolute
    /// path, or `None` when the parent itself is gone.
    fn ensure_child(&mut self, parent: &str, name: &str) -> Option<Arc<str>> {
        if !self.nodes.contains_key(parent) {
            return None;
        }
        let child_path: Arc<str> = path_util::join(parent, name).into();
        let parent_node = self.nodes.get_mut(parent)?;
        if let Some(existing) = parent_node.children.get(name) {
            return Some(existing.clone());
        }
        parent_node
            .children
            .insert(name.to_string(), child_path.clone());
        self.nodes.insert(child_path.clone(), DirNode::new());
        Some(child_path)
    }

    /// Drops the named child of `parent` and its whole subtree from the arena. Descendant
    /// handles observe the absence; no per-key events are fired.
    fn remove_child(&mut self, parent: &str, name: &str) -> bool {
        let child_path = match self.nodes.get_mut(parent) {
            Some(node) => node.children.shift_remove(name),
            None => None,
        };
        let mut stack = match child_path {
            Some(path) => vec![path],
            None => return false,
        };
        while let Some(path) = stack.pop() {
            if let Some(node) = self.nodes.remove(&path) {
                stack.extend(node.children.into_iter().map(|(_, p)| p));
            }
        }
        true
    }

    fn reset_pending(&mut self) {
        for node in self.nodes.values_mut() {
            node.kernel.reset_pending();
            node.pending_subdirs.clear();
        }
    }

    /// Recursive snapshot body of the subtree rooted at `path`.
    fn data_object(&self, path: &str) -> DirectoryDataObject {
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return DirectoryDataObject::default(),
        };
        let storage: IndexMap<String, SerializableValue> = node
            .kernel
            .entries()
            .map(|(k, v)| (k.clone(), v.make_serializable()))
            .collect();
        let mut subdirectories = IndexMap::new();
        for (name, child_path) in &node.children {
            subdirectories.insert(name.clone(), self.data_object(child_path));
        }
        DirectoryDataObject {
            storage: if storage.is_empty() { None } else { Some(storage) },
            subdirectories: if subdirectories.is_empty() {
                None
            } else {
                Some(subdirectories)
            },
        }
    }
}

pub(crate) struct DirectoryInner {
    id: String,
    runtime: Arc<dyn ContainerRuntime>,
    registry: ValueTypeRegistry,
    tree: AtomicRefCell<DirTree>,
    pending: AtomicRefCell<VecDeque<PendingLocalMessage>>,
    events: ChannelEvents,
    handlers: HashMap<&'static str, Box<dyn DirectoryMessageHandler>>,
}

/// A hierarchical, collaborative key-value container.
///
/// The directory is a tree of [SubDirectoryRef] nodes addressed by absolute POSIX-style paths,
/// each node carrying its own key storage with the same optimistic reconciliation a
/// [crate::SharedMap] uses for its flat key-space. Inbound sequenced operations are routed by
/// operation type and target path; operations addressed to a subdirectory that was deleted
/// concurrently are dropped.
#[derive(Clone)]
pub struct SharedDirectory {
    inner: Arc<DirectoryInner>,
}

/// Handle to a single node of the directory tree. Cheap to clone.
///
/// Handles address their node by absolute path. Once the node is deleted from the tree, reads
/// observe absence and local mutations become no-ops; a handle never resurrects its subtree.
#[derive(Clone)]
pub struct SubDirectoryRef {
    inner: Arc<DirectoryInner>,
    absolute_path: Arc<str>,
}

impl SharedDirectory {
    /// Creates an empty, detached directory holding just the root node.
    pub fn new<S: Into<String>>(
        id: S,
        runtime: Arc<dyn ContainerRuntime>,
        registry: ValueTypeRegistry,
    ) -> Self {
        let mut handlers: HashMap<&'static str, Box<dyn DirectoryMessageHandler>> = HashMap::new();
        handlers.insert("set", Box::new(SetHandler));
        handlers.insert("delete", Box::new(DeleteHandler));
        handlers.insert("clear", Box::new(ClearHandler));
        handlers.insert("createSubDirectory", Box::new(CreateSubDirectoryHandler));
        handlers.insert("deleteSubDirectory", Box::new(DeleteSubDirectoryHandler));
        handlers.insert("act", Box::new(ActHandler));
        SharedDirectory {
            inner: Arc::new(DirectoryInner {
                id: id.into(),
                runtime,
                registry,
                tree: AtomicRefCell::new(DirTree::new()),
                pending: AtomicRefCell::new(VecDeque::new()),
                events: ChannelEvents::default(),
                handlers,
            }),
        }
    }

    /// Restores a directory from a snapshot previously produced by [SharedDirectory::snapshot].
    pub async fn load<S: Into<String>>(
        id: S,
        runtime: Arc<dyn ContainerRuntime>,
        registry: ValueTypeRegistry,
        storage: &dyn ChannelStorage,
    ) -> Result<Self, Error> {
        let directory = SharedDirectory::new(id, runtime, registry);
        let data = snapshot::load_directory(storage).await?;
        directory.populate(ROOT_PATH, &data)?;
        Ok(directory)
    }

    fn populate(&self, path: &str, data: &DirectoryDataObject) -> Result<(), Error> {
        if let Some(entries) = &data.storage {
            for (key, serializable) in entries {
                let emitter = self
                    .inner
                    .emitter(key, Some(path), &serializable.value_type);
                let value = self.inner.registry.from_serializable(serializable, emitter)?;
                let mut tree = self.inner.tree.borrow_mut();
                if let Some(node) = tree.node_mut(path) {
                    node.kernel.set_local(key.clone(), value);
                }
            }
        }
        if let Some(subdirectories) = &data.subdirectories {
            for (name, child) in subdirectories {
                let child_path = self.inner.tree.borrow_mut().ensure_child(path, name);
                if let Some(child_path) = child_path {
                    self.populate(&child_path, child)?;
                }
            }
        }
        Ok(())
    }

    /// The root node, at path `/`.
    pub fn root(&self) -> SubDirectoryRef {
        SubDirectoryRef {
            inner: self.inner.clone(),
            absolute_path: ROOT_PATH.into(),
        }
    }

    /// Resolves `path` (absolute, or relative to the root) to a node of the tree.
    pub fn get_working_directory(&self, path: &str) -> Option<SubDirectoryRef> {
        self.root().get_working_directory(path)
    }

    pub fn create_sub_directory(&self, name: &str) -> Result<SubDirectoryRef, Error> {
        self.root().create_sub_directory(name)
    }

    pub fn get_sub_directory(&self, name: &str) -> Option<SubDirectoryRef> {
        self.root().get_sub_directory(name)
    }

    pub fn has_sub_directory(&self, name: &str) -> bool {
        self.root().has_sub_directory(name)
    }

    pub fn delete_sub_directory(&self, name: &str) -> bool {
        self.root().delete_sub_directory(name)
    }

    pub fn subdirectories(&self) -> Vec<(String, SubDirectoryRef)> {
        self.root().subdirectories()
    }

    pub fn get(&self, key: &str) -> Option<LocalValue> {
        self.root().get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.root().has(key)
    }

    pub fn set<V: Into<Json>>(&self, key: &str, value: V) -> Result<(), Error> {
        self.root().set(key, value)
    }

    pub fn set_handle(&self, key: &str, handle: SharedHandle) -> Result<(), Error> {
        self.root().set_handle(key, handle)
    }

    pub fn create_value_type(
        &self,
        key: &str,
        type_name: &str,
        params: Json,
    ) -> Result<Arc<dyn ValueTypeInstance>, Error> {
        self.root().create_value_type(key, type_name, params)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.root().delete(key)
    }

    pub fn clear(&self) {
        self.root().clear()
    }

    pub fn keys(&self) -> Vec<String> {
        self.root().keys()
    }

    pub fn values(&self) -> Vec<LocalValue> {
        self.root().values()
    }

    pub fn entries(&self) -> Vec<(String, LocalValue)> {
        self.root().entries()
    }

    pub fn len(&self) -> usize {
        self.root().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().is_empty()
    }

    pub async fn wait(&self, key: &str) -> LocalValue {
        self.root().wait(key).await
    }

    /// Ingests one sequenced message addressed to this directory.
    ///
    /// Routing is by operation type: the matching handler's prepare phase (the only suspension
    /// point) materializes whatever the operation carries, then processing synchronously
    /// resolves the target node by path and delegates to it. A returned error means the message
    /// was skipped with no state change.
    pub async fn process_message(
        &self,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        inner.events.pre_op.trigger(message, local, Some(message));
        let kind = message.contents.kind();
        let handler = inner
            .handlers
            .get(kind)
            .ok_or_else(|| Error::UnknownOperation(kind.to_string()))?;
        let context = handler.prepare(inner, message, local).await?;
        if local {
            inner.ack(message.client_sequence_number);
        }
        handler.process(inner, message, context, local);
        inner.events.op.trigger(message, local, Some(message));
        Ok(())
    }

    /// Re-drives outstanding local operations after the container connects (or reconnects),
    /// routing each through its operation type's submit logic so pending markers are rebuilt
    /// with the freshly assigned client sequence numbers.
    pub fn connect(&self) {
        let inner = &self.inner;
        let outstanding: Vec<PendingLocalMessage> = inner.pending.borrow_mut().drain(..).collect();
        inner.tree.borrow_mut().reset_pending();
        for message in outstanding {
            if let Some(handler) = inner.handlers.get(message.op.kind()) {
                handler.submit(inner, message.op);
            }
        }
    }

    /// Registers every handle held anywhere in the tree with the host runtime.
    pub fn bind_handles(&self) {
        let urls: Vec<String> = {
            let tree = self.inner.tree.borrow();
            tree.nodes
                .values()
                .flat_map(|node| {
                    node.kernel
                        .entries()
                        .filter_map(|(_, v)| v.as_handle().map(|h| h.url.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for url in urls {
            self.inner.runtime.bind_handle(&url);
        }
    }

    /// Serializes the whole tree into its snapshot form.
    pub fn snapshot(&self) -> Result<Tree, Error> {
        let data = self.inner.tree.borrow().data_object(ROOT_PATH);
        snapshot::serialize_directory(&data)
    }

    /// Subscribes a callback to `valueChanged` anywhere in the tree; the event carries the
    /// absolute path of the node that changed.
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
    pub(crate) fn pending_message_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn data_object(&self) -> DirectoryDataObject {
        self.inner.tree.borrow().data_object(ROOT_PATH)
    }
}

impl SharedObject for SharedDirectory {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn type_uri(&self) -> &'static str {
        DIRECTORY_TYPE_URI
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            channel_type: DIRECTORY_TYPE_URI.to_string(),
            snapshot_format_version: DIRECTORY_SNAPSHOT_FORMAT_VERSION.to_string(),
        }
    }

    fn handle(&self) -> SharedHandle {
        SharedHandle::new(self.inner.id.clone())
    }
}

impl std::fmt::Debug for SharedDirectory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let tree = self.inner.tree.borrow();
        let mut s = f.debug_struct(&self.inner.id);
        let mut paths: Vec<&Arc<str>> = tree.nodes.keys().collect();
        paths.sort();
        for path in paths {
            if let Some(node) = tree.nodes.get(path) {
                s.field(path, &node.kernel.len());
            }
        }
        s.finish()
    }
}

impl SubDirectoryRef {
    /// Canonical absolute path of this node.
    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }

    /// Whether the node still exists in the tree.
    pub fn alive(&self) -> bool {
        self.inner.tree.borrow().node(&self.absolute_path).is_some()
    }

    pub fn get(&self, key: &str) -> Option<LocalValue> {
        self.inner
            .tree
            .borrow()
            .node(&self.absolute_path)
            .and_then(|node| node.kernel.get(key).cloned())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner
            .tree
            .borrow()
            .node(&self.absolute_path)
            .map_or(0, |node| node.kernel.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of this node only, in insertion order; descendants are not included.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .tree
            .borrow()
            .node(&self.absolute_path)
            .map_or_else(Vec::new, |node| node.kernel.keys().cloned().collect())
    }

    pub fn values(&self) -> Vec<LocalValue> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    pub fn entries(&self) -> Vec<(String, LocalValue)> {
        self.inner
            .tree
            .borrow()
            .node(&self.absolute_path)
            .map_or_else(Vec::new, |node| {
                node.kernel
                    .entries()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
    }

    pub fn for_each<F: FnMut(&LocalValue, &str)>(&self, mut f: F) {
        for (key, value) in self.entries() {
            f(&value, &key);
        }
    }

    /// Stores a plain JSON value under `key` in this node.
    pub fn set<V: Into<Json>>(&self, key: &str, value: V) -> Result<(), Error> {
        validate_key(key)?;
        self.set_value(key, LocalValue::Plain(value.into()))
    }

    /// Stores a handle reference to another shared object under `key` in this node.
    pub fn set_handle(&self, key: &str, handle: SharedHandle) -> Result<(), Error> {
        validate_key(key)?;
        if self.inner.runtime.attached() {
            self.inner.runtime.bind_handle(&handle.url);
        }
        self.set_value(key, LocalValue::Shared(handle))
    }

    /// Creates a value of a registered value type under `key`, returning the live instance.
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
        let emitter = self
            .inner
            .emitter(key, Some(&self.absolute_path), type_name);
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
        let previous = {
            let mut tree = self.inner.tree.borrow_mut();
            match tree.node_mut(&self.absolute_path) {
                Some(node) => node.kernel.set_local(key.to_string(), value),
                None => {
                    debug!(path = %self.absolute_path, "dropping set on a deleted subdirectory");
                    return Ok(());
                }
            }
        };
        self.inner.events.value_changed.trigger(
            &ValueChangedEvent {
                key: key.to_string(),
                previous_value: previous.map(|v| v.make_serializable()),
                path: Some(self.absolute_path.to_string()),
            },
            true,
            None,
        );
        let client_seq = self.inner.submit(Operation::Set {
            key: key.to_string(),
            path: Some(self.absolute_path.to_string()),
            value: serializable,
        });
        if let Some(node) = self.inner.tree.borrow_mut().node_mut(&self.absolute_path) {
            node.kernel.mark_pending_key(key, client_seq);
        }
        Ok(())
    }

    /// Deletes `key` from this node, returning whether it existed locally at the time of the
    /// call.
    pub fn delete(&self, key: &str) -> bool {
        let previous = {
            let mut tree = self.inner.tree.borrow_mut();
            match tree.node_mut(&self.absolute_path) {
                Some(node) => node.kernel.delete_local(key),
                None => return false,
            }
        };
        let existed = previous.is_some();
        self.inner.events.value_changed.trigger(
            &ValueChangedEvent {
                key: key.to_string(),
                previous_value: previous.map(|v| v.make_serializable()),
                path: Some(self.absolute_path.to_string()),
            },
            true,
            None,
        );
        let client_seq = self.inner.submit(Operation::Delete {
            key: key.to_string(),
            path: Some(self.absolute_path.to_string()),
        });
        if let Some(node) = self.inner.tree.borrow_mut().node_mut(&self.absolute_path) {
            node.kernel.mark_pending_key(key, client_seq);
        }
        existed
    }

    /// Wipes all keys of this node. Children are untouched.
    pub fn clear(&self) {
        {
            let mut tree = self.inner.tree.borrow_mut();
            match tree.node_mut(&self.absolute_path) {
                Some(node) => node.kernel.clear_local(),
                None => return,
            }
        }
        self.inner.events.clear.trigger(
            &ClearEvent {
                path: Some(self.absolute_path.to_string()),
            },
            true,
            None,
        );
        let client_seq = self.inner.submit(Operation::Clear {
            path: Some(self.absolute_path.to_string()),
        });
        if let Some(node) = self.inner.tree.borrow_mut().node_mut(&self.absolute_path) {
            node.kernel.mark_pending_clear(client_seq);
        }
    }

    /// Resolves with the value under `key` in this node: immediately when present, otherwise
    /// when the next matching `valueChanged` fires.
    pub async fn wait(&self, key: &str) -> LocalValue {
        loop {
            // subscribe before checking, so a concurrent set cannot slip between the two
            let (tx, rx) = oneshot::channel();
            let tx = Mutex::new(Some(tx));
            let wanted_key = key.to_string();
            let wanted_path = self.absolute_path.to_string();
            let _sub = self.inner.events.value_changed.subscribe(move |e, _, _| {
                if e.key == wanted_key && e.path.as_deref() == Some(wanted_path.as_str()) {
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

    /// Creates (or returns) the named child of this node. Creation is idempotent, but the
    /// lifecycle operation is submitted either way so remote replicas observe the intent.
    pub fn create_sub_directory(&self, name: &str) -> Result<SubDirectoryRef, Error> {
        if !path_util::is_valid_component(name) {
            return Err(Error::InvalidSubDirectoryName(name.to_string()));
        }
        let created = self
            .inner
            .tree
            .borrow_mut()
            .ensure_child(&self.absolute_path, name);
        let child_path = match created {
            Some(path) => path,
            None => {
                debug!(path = %self.absolute_path, "dropping createSubDirectory on a deleted subdirectory");
                return Ok(SubDirectoryRef {
                    inner: self.inner.clone(),
                    absolute_path: path_util::join(&self.absolute_path, name).into(),
                });
            }
        };
        let client_seq = self.inner.submit(Operation::CreateSubDirectory {
            path: self.absolute_path.to_string(),
            subdir_name: name.to_string(),
        });
        if let Some(node) = self.inner.tree.borrow_mut().node_mut(&self.absolute_path) {
            node.pending_subdirs.insert(name.to_string(), client_seq);
        }
        Ok(SubDirectoryRef {
            inner: self.inner.clone(),
            absolute_path: child_path,
        })
    }

    pub fn get_sub_directory(&self, name: &str) -> Option<SubDirectoryRef> {
        let child_path = self
            .inner
            .tree
            .borrow()
            .node(&self.absolute_path)?
            .children
            .get(name)
            .cloned()?;
        Some(SubDirectoryRef {
            inner: self.inner.clone(),
            absolute_path: child_path,
        })
    }

    pub fn has_sub_directory(&self, name: &str) -> bool {
        self.inner
            .tree
            .borrow()
            .node(&self.absolute_path)
            .map_or(false, |node| node.children.contains_key(name))
    }

    /// Drops the named child and its whole subtree, returning whether it existed. No events are
    /// fired for the discarded descendant keys.
    pub fn delete_sub_directory(&self, name: &str) -> bool {
        let removed = self
            .inner
            .tree
            .borrow_mut()
            .remove_child(&self.absolute_path, name);
        if self.inner.tree.borrow().node(&self.absolute_path).is_none() {
            return removed;
        }
        let client_seq = self.inner.submit(Operation::DeleteSubDirectory {
            path: self.absolute_path.to_string(),
            subdir_name: name.to_string(),
        });
        if let Some(node) = self.inner.tree.borrow_mut().node_mut(&self.absolute_path) {
            node.pending_subdirs.insert(name.to_string(), client_seq);
        }
        removed
    }

    /// Resolves `path` against this node's absolute path, POSIX style, and walks the tree.
    /// Returns `None` on any missing component.
    pub fn get_working_directory(&self, path: &str) -> Option<SubDirectoryRef> {
        let absolute = path_util::resolve(&self.absolute_path, path);
        if self.inner.tree.borrow().node(&absolute).is_none() {
            return None;
        }
        Some(SubDirectoryRef {
            inner: self.inner.clone(),
            absolute_path: absolute.into(),
        })
    }

    /// This node's direct children, in creation order.
    pub fn subdirectories(&self) -> Vec<(String, SubDirectoryRef)> {
        self.inner
            .tree
            .borrow()
            .node(&self.absolute_path)
            .map_or_else(Vec::new, |node| {
                node.children
                    .iter()
                    .map(|(name, path)| {
                        (
                            name.clone(),
                            SubDirectoryRef {
                                inner: self.inner.clone(),
                                absolute_path: path.clone(),
                            },
                        )
                    })
                    .collect()
            })
    }
}

fn validate_key(key: &str) -> Result<(), Error> {
    if key.is_empty() {
        Err(Error::InvalidKey)
    } else {
        Ok(())
    }
}

impl DirectoryInner {
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

    fn emitter(
        self: &Arc<Self>,
        key: &str,
        path: Option<&str>,
        type_name: &str,
    ) -> ValueOpEmitter {
        let concrete: Weak<Self> = Arc::downgrade(self);
        let weak: Weak<dyn ActChannel> = concrete;
        ValueOpEmitter::new(type_name, key, path, weak)
    }
}

impl ActChannel for DirectoryInner {
    fn emit_act(
        &self,
        key: &str,
        path: Option<&str>,
        previous: SerializableValue,
        op: ValueTypeOp,
    ) {
        self.submit(Operation::Act {
            key: key.to_string(),
            path: path.map(str::to_string),
            value: op,
        });
        self.events.value_changed.trigger(
            &ValueChangedEvent {
                key: key.to_string(),
                previous_value: Some(previous),
                path: path.map(str::to_string),
            },
            true,
            None,
        );
    }
}

/// Per-operation-type routing target. `prepare` materializes inbound payloads and may suspend;
/// `process` synchronously resolves the target node by path and applies; `submit` re-drives an
/// outstanding local operation on reconnect.
#[async_trait]
trait DirectoryMessageHandler: Send + Sync {
    async fn prepare(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<OpContext, Error>;

    fn process(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        context: OpContext,
        local: bool,
    );

    fn submit(&self, inner: &Arc<DirectoryInner>, op: Operation);
}

fn op_path(op: &Operation) -> &str {
    op.path().unwrap_or(ROOT_PATH)
}

struct SetHandler;

#[async_trait]
impl DirectoryMessageHandler for SetHandler {
    async fn prepare(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<OpContext, Error> {
        if let Operation::Set { key, path, value } = &message.contents {
            if !local {
                let emitter = inner.emitter(key, Some(path.as_deref().unwrap_or(ROOT_PATH)), &value.value_type);
                let value = inner.registry.from_serializable(value, emitter)?;
                return Ok(Some(Box::new(value)));
            }
        }
        Ok(None)
    }

    fn process(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        context: OpContext,
        local: bool,
    ) {
        let (key, path) = match &message.contents {
            Operation::Set { key, .. } => (key, op_path(&message.contents)),
            _ => return,
        };
        let value = context.and_then(|c| c.downcast::<LocalValue>().ok());
        let applied = {
            let mut tree = inner.tree.borrow_mut();
            let node = match tree.node_mut(path) {
                Some(node) => node,
                None => {
                    debug!(path = %path, "dropping set for a missing subdirectory");
                    return;
                }
            };
            if node
                .kernel
                .needs_process_key(key, local, message.client_sequence_number)
            {
                value.map(|v| node.kernel.process_set(key.clone(), *v))
            } else {
                None
            }
        };
        if let Some(Applied::Key { key, previous }) = applied {
            inner.events.value_changed.trigger(
                &ValueChangedEvent {
                    key,
                    previous_value: previous.map(|v| v.make_serializable()),
                    path: Some(path.to_string()),
                },
                local,
                Some(message),
            );
        }
    }

    fn submit(&self, inner: &Arc<DirectoryInner>, op: Operation) {
        let (key, path) = match &op {
            Operation::Set { key, .. } => (key.clone(), op_path(&op).to_string()),
            _ => return,
        };
        let client_seq = inner.submit(op);
        if let Some(node) = inner.tree.borrow_mut().node_mut(&path) {
            node.kernel.mark_pending_key(&key, client_seq);
        }
    }
}

struct DeleteHandler;

#[async_trait]
impl DirectoryMessageHandler for DeleteHandler {
    async fn prepare(
        &self,
        _inner: &Arc<DirectoryInner>,
        _message: &SequencedMessage,
        _local: bool,
    ) -> Result<OpContext, Error> {
        Ok(None)
    }

    fn process(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        _context: OpContext,
        local: bool,
    ) {
        let (key, path) = match &message.contents {
            Operation::Delete { key, .. } => (key, op_path(&message.contents)),
            _ => return,
        };
        let applied = {
            let mut tree = inner.tree.borrow_mut();
            let node = match tree.node_mut(path) {
                Some(node) => node,
                None => {
                    debug!(path = %path, "dropping delete for a missing subdirectory");
                    return;
                }
            };
            if node
                .kernel
                .needs_process_key(key, local, message.client_sequence_number)
            {
                Some(node.kernel.process_delete(key))
            } else {
                None
            }
        };
        if let Some(Applied::Key { key, previous }) = applied {
            inner.events.value_changed.trigger(
                &ValueChangedEvent {
                    key,
                    previous_value: previous.map(|v| v.make_serializable()),
                    path: Some(path.to_string()),
                },
                local,
                Some(message),
            );
        }
    }

    fn submit(&self, inner: &Arc<DirectoryInner>, op: Operation) {
        let (key, path) = match &op {
            Operation::Delete { key, .. } => (key.clone(), op_path(&op).to_string()),
            _ => return,
        };
        let client_seq = inner.submit(op);
        if let Some(node) = inner.tree.borrow_mut().node_mut(&path) {
            node.kernel.mark_pending_key(&key, client_seq);
        }
    }
}

struct ClearHandler;

#[async_trait]
impl DirectoryMessageHandler for ClearHandler {
    async fn prepare(
        &self,
        _inner: &Arc<DirectoryInner>,
        _message: &SequencedMessage,
        _local: bool,
    ) -> Result<OpContext, Error> {
        Ok(None)
    }

    fn process(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        _context: OpContext,
        local: bool,
    ) {
        let path = op_path(&message.contents);
        let applied = {
            let mut tree = inner.tree.borrow_mut();
            match tree.node_mut(path) {
                Some(node) => node
                    .kernel
                    .process_clear(local, message.client_sequence_number),
                None => {
                    debug!(path = %path, "dropping clear for a missing subdirectory");
                    return;
                }
            }
        };
        if applied == Applied::Cleared {
            inner.events.clear.trigger(
                &ClearEvent {
                    path: Some(path.to_string()),
                },
                local,
                Some(message),
            );
        }
    }

    fn submit(&self, inner: &Arc<DirectoryInner>, op: Operation) {
        let path = op_path(&op).to_string();
        let client_seq = inner.submit(op);
        if let Some(node) = inner.tree.borrow_mut().node_mut(&path) {
            node.kernel.mark_pending_clear(client_seq);
        }
    }
}

struct CreateSubDirectoryHandler;

#[async_trait]
impl DirectoryMessageHandler for CreateSubDirectoryHandler {
    async fn prepare(
        &self,
        _inner: &Arc<DirectoryInner>,
        _message: &SequencedMessage,
        _local: bool,
    ) -> Result<OpContext, Error> {
        Ok(None)
    }

    fn process(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        _context: OpContext,
        local: bool,
    ) {
        let (path, name) = match &message.contents {
            Operation::CreateSubDirectory { path, subdir_name } => (path, subdir_name),
            _ => return,
        };
        if !path_util::is_valid_component(name) {
            debug!(name = %name, "dropping createSubDirectory with an invalid name");
            return;
        }
        let mut tree = inner.tree.borrow_mut();
        let should_apply = match tree.node_mut(path) {
            Some(node) => {
                node.needs_process_subdir(name, local, message.client_sequence_number)
            }
            None => {
                debug!(path = %path, "dropping createSubDirectory for a missing subdirectory");
                return;
            }
        };
        if should_apply {
            tree.ensure_child(path, name);
        }
    }

    fn submit(&self, inner: &Arc<DirectoryInner>, op: Operation) {
        let (path, name) = match &op {
            Operation::CreateSubDirectory { path, subdir_name } => {
                (path.clone(), subdir_name.clone())
            }
            _ => return,
        };
        let client_seq = inner.submit(op);
        if let Some(node) = inner.tree.borrow_mut().node_mut(&path) {
            node.pending_subdirs.insert(name, client_seq);
        }
    }
}

struct DeleteSubDirectoryHandler;

#[async_trait]
impl DirectoryMessageHandler for DeleteSubDirectoryHandler {
    async fn prepare(
        &self,
        _inner: &Arc<DirectoryInner>,
        _message: &SequencedMessage,
        _local: bool,
    ) -> Result<OpContext, Error> {
        Ok(None)
    }

    fn process(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        _context: OpContext,
        local: bool,
    ) {
        let (path, name) = match &message.contents {
            Operation::DeleteSubDirectory { path, subdir_name } => (path, subdir_name),
            _ => return,
        };
        let mut tree = inner.tree.borrow_mut();
        let should_apply = match tree.node_mut(path) {
            Some(node) => {
                node.needs_process_subdir(name, local, message.client_sequence_number)
            }
            None => {
                debug!(path = %path, "dropping deleteSubDirectory for a missing subdirectory");
                return;
            }
        };
        if should_apply {
            tree.remove_child(path, name);
        }
    }

    fn submit(&self, inner: &Arc<DirectoryInner>, op: Operation) {
        let (path, name) = match &op {
            Operation::DeleteSubDirectory { path, subdir_name } => {
                (path.clone(), subdir_name.clone())
            }
            _ => return,
        };
        let client_seq = inner.submit(op);
        if let Some(node) = inner.tree.borrow_mut().node_mut(&path) {
            node.pending_subdirs.insert(name, client_seq);
        }
    }
}

struct ActHandler;

#[async_trait]
impl DirectoryMessageHandler for ActHandler {
    async fn prepare(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<OpContext, Error> {
        let (key, op) = match &message.contents {
            Operation::Act { key, value, .. } => (key, value),
            _ => return Ok(None),
        };
        if local {
            return Ok(None);
        }
        let path = op_path(&message.contents);
        let value = {
            let tree = inner.tree.borrow();
            let node = match tree.node(path) {
                Some(node) => node,
                None => return Ok(None),
            };
            if node.kernel.has_pending_clear() {
                return Ok(None);
            }
            match node.kernel.get(key).and_then(|v| v.as_value_type().cloned()) {
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

    fn process(
        &self,
        inner: &Arc<DirectoryInner>,
        message: &SequencedMessage,
        context: OpContext,
        local: bool,
    ) {
        if local {
            // already applied when the instance mutated itself at emit time
            return;
        }
        let (key, op) = match &message.contents {
            Operation::Act { key, value, .. } => (key, value),
            _ => return,
        };
        let path = op_path(&message.contents);
        let value = {
            let tree = inner.tree.borrow();
            let node = match tree.node(path) {
                Some(node) => node,
                None => {
                    debug!(path = %path, "dropping act for a missing subdirectory");
                    return;
                }
            };
            if node.kernel.has_pending_clear() {
                return;
            }
            node.kernel.get(key).and_then(|v| v.as_value_type().cloned())
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
        inner.events.value_changed.trigger(
            &ValueChangedEvent {
                key: key.clone(),
                previous_value: Some(previous),
                path: Some(path.to_string()),
            },
            local,
            Some(message),
        );
    }

    fn submit(&self, inner: &Arc<DirectoryInner>, op: Operation) {
        inner.submit(op);
    }
}
