//! Opmap is a library of collaborative key-value containers whose state replicates across
//! processes through an external, totally-ordered operation log.
//!
//! Two containers are provided:
//!
//! - [SharedMap] - a flat key-value space.
//! - [SharedDirectory] - a tree of key-value nodes addressed by absolute POSIX-style paths.
//!
//! Both follow the same optimistic model: a local mutation applies immediately, is serialized as
//! an [Operation] and submitted to the ordering service, and eventually comes back on the
//! inbound delta stream as a [SequencedMessage] together with every other replica's operations.
//! Reconciliation against the locally-pending operation set makes replay idempotent and gives
//! last-writer-wins convergence per key, with local unacknowledged writes shadowing remote ones
//! until their echoes arrive.
//!
//! Values are either plain JSON payloads, handle references to other shared objects, or
//! instances of pluggable [ValueType]s whose own mutations flow through the same log as `act`
//! operations. Full container state serializes to a tree of named blobs ([SharedMap] partitions
//! large state across size-bounded chunks) and restores from it.
//!
//! The ordering service, blob storage, and host runtime are external collaborators, consumed
//! through the traits in [ContainerRuntime] and [ChannelStorage].
//!
//! ```
//! use opmap::{SharedMap, ValueTypeRegistry};
//! # use opmap::{ContainerRuntime, Operation, SharedObject, Error};
//! # use std::sync::Arc;
//! # struct Detached;
//! # #[async_trait::async_trait]
//! # impl ContainerRuntime for Detached {
//! #     fn submit_local_message(&self, _op: &Operation) -> i64 { -1 }
//! #     fn attached(&self) -> bool { false }
//! #     async fn resolve_handle(&self, url: &str) -> Result<Arc<dyn SharedObject>, Error> {
//! #         Err(Error::UnresolvedHandle(url.to_string()))
//! #     }
//! #     fn bind_handle(&self, _url: &str) {}
//! # }
//!
//! let runtime = Arc::new(Detached);
//! let map = SharedMap::new("my-map", runtime, ValueTypeRegistry::new());
//! map.set("title", serde_json::json!("hello")).unwrap();
//! assert!(map.has("title"));
//! ```

mod error;
mod kernel;
mod observer;
mod protocol;
mod runtime;
mod snapshot;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod types;
mod utils;
mod value;

pub use error::Error;
pub use observer::{Observer, Subscription};
pub use protocol::{
    Operation, SequencedMessage, SerializableValue, ValueTypeOp, MESSAGE_TYPE_OPERATION,
    VALUE_TYPE_PLAIN, VALUE_TYPE_SHARED,
};
pub use runtime::{
    Attributes, Blob, ChannelStorage, ContainerRuntime, SharedHandle, SharedObject, Tree,
    TreeEntry, DIRECTORY_SNAPSHOT_FORMAT_VERSION, DIRECTORY_TYPE_URI, MAP_SNAPSHOT_FORMAT_VERSION,
    MAP_TYPE_URI, UNATTACHED_CLIENT_SEQ,
};
pub use snapshot::{
    DirectoryDataObject, HEADER_BLOB_NAME, MAX_SNAPSHOT_BLOB_SIZE,
    MIN_VALUE_SIZE_SEPARATE_SNAPSHOT_BLOB,
};
pub use types::{
    ClearEvent, SharedDirectory, SharedMap, SubDirectoryRef, ValueChangedEvent,
};
pub use value::{
    LocalValue, OpContext, ValueOpEmitter, ValueOpHandler, ValueType, ValueTypeInstance,
    ValueTypeLocalValue, ValueTypeRegistry,
};
