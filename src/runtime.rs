use crate::error::Error;
use crate::protocol::Operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Type URI under which map channels register with the host runtime.
pub const MAP_TYPE_URI: &str = "https://graph.microsoft.com/types/map";

/// Type URI under which directory channels register with the host runtime.
pub const DIRECTORY_TYPE_URI: &str = "https://graph.microsoft.com/types/directory";

/// Snapshot format version written by map snapshots (partitioned multi-blob scheme).
pub const MAP_SNAPSHOT_FORMAT_VERSION: &str = "0.2";

/// Snapshot format version written by directory snapshots (whole-tree single blob).
pub const DIRECTORY_SNAPSHOT_FORMAT_VERSION: &str = "0.1";

/// Sentinel returned by [ContainerRuntime::submit_local_message] while the container is not
/// attached to the ordering service.
pub const UNATTACHED_CLIENT_SEQ: i64 = -1;

/// Channel metadata stored alongside snapshots, letting loaders dispatch on format revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub snapshot_format_version: String,
}

/// Reference to another shared object, storable as a value.
///
/// Handles serialize as the payload of a `"Shared"` serialized value and resolve lazily through
/// the host runtime; a container holding a handle does not own the referenced object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedHandle {
    pub url: String,
}

impl SharedHandle {
    pub fn new<S: Into<String>>(url: S) -> Self {
        SharedHandle { url: url.into() }
    }

    /// Resolves the referenced shared object through the host runtime.
    pub async fn get(
        &self,
        runtime: &dyn ContainerRuntime,
    ) -> Result<Arc<dyn SharedObject>, Error> {
        runtime.resolve_handle(&self.url).await
    }
}

/// Surface common to all shared containers registered with a host runtime.
pub trait SharedObject: Send + Sync {
    /// Channel identifier, unique within the owning host runtime.
    fn id(&self) -> &str;

    /// Type URI the container registers under.
    fn type_uri(&self) -> &'static str;

    /// Channel metadata recorded with every snapshot.
    fn attributes(&self) -> Attributes;

    /// Handle through which other containers can reference this one as a value.
    fn handle(&self) -> SharedHandle;
}

/// Services a host runtime grants to a container channel.
///
/// The ordering service behind `submit_local_message` assigns each submitted operation a
/// client sequence number and eventually echoes it back on the inbound delta stream inside a
/// [crate::SequencedMessage].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Submits a local operation, returning the assigned client sequence number, or
    /// [UNATTACHED_CLIENT_SEQ] when the container is not attached yet.
    fn submit_local_message(&self, op: &Operation) -> i64;

    /// Whether the container is attached to the ordering service.
    fn attached(&self) -> bool;

    /// Resolves a handle URL to the shared object it references.
    async fn resolve_handle(&self, url: &str) -> Result<Arc<dyn SharedObject>, Error>;

    /// Registers a child shared object with the host, so it attaches together with the
    /// container that stores its handle.
    fn bind_handle(&self, url: &str);
}

/// Read access to the named blobs of a snapshot.
#[async_trait]
pub trait ChannelStorage: Send + Sync {
    /// Reads a named blob, returning its base64-encoded contents.
    async fn read(&self, name: &str) -> Result<String, Error>;

    fn contains(&self, name: &str) -> bool;
}

/// A snapshot artifact: a flat tree of named blobs handed to blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Tree {
    /// Looks up an entry by blob name.
    pub fn entry(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: String,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub value: Blob,
}

impl TreeEntry {
    /// A UTF-8 blob entry under the given name.
    pub fn blob<S: Into<String>>(path: S, contents: String) -> Self {
        TreeEntry {
            mode: "100644".to_string(),
            path: path.into(),
            entry_type: "Blob".to_string(),
            value: Blob {
                contents,
                encoding: "utf-8".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub contents: String,
    pub encoding: String,
}
