use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Serialized-value kind for raw JSON payloads.
pub const VALUE_TYPE_PLAIN: &str = "Plain";

/// Serialized-value kind for handle references to other shared objects.
pub const VALUE_TYPE_SHARED: &str = "Shared";

/// Message type the ordering service assigns to operation payloads.
pub const MESSAGE_TYPE_OPERATION: &str = "op";

/// A value in its serialized form, as carried by operations and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableValue {
    /// Either [VALUE_TYPE_PLAIN], [VALUE_TYPE_SHARED], or the name of a registered value type.
    #[serde(rename = "type")]
    pub value_type: String,

    /// JSON payload. Opaque to the containers when `value_type` names a registered value type.
    pub value: Json,
}

impl SerializableValue {
    pub fn plain(value: Json) -> Self {
        SerializableValue {
            value_type: VALUE_TYPE_PLAIN.to_string(),
            value,
        }
    }
}

/// Payload of an `act` operation: a mutation defined by a registered value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueTypeOp {
    #[serde(rename = "opName")]
    pub op_name: String,
    pub value: Json,
}

/// The on-wire operation sum. The `type` discriminator and the field names are canonical JSON;
/// the `path` field is absent for flat-map kernels.
///
/// Unrecognized operation types deserialize into [Operation::Unknown] so that ingest can tolerate
/// messages emitted by newer protocol revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "set")]
    Set {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        value: SerializableValue,
    },
    #[serde(rename = "delete")]
    Delete {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    #[serde(rename = "clear")]
    Clear {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    #[serde(rename = "createSubDirectory")]
    CreateSubDirectory {
        path: String,
        #[serde(rename = "subdirName")]
        subdir_name: String,
    },
    #[serde(rename = "deleteSubDirectory")]
    DeleteSubDirectory {
        path: String,
        #[serde(rename = "subdirName")]
        subdir_name: String,
    },
    #[serde(rename = "act")]
    Act {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        value: ValueTypeOp,
    },
    #[serde(other)]
    Unknown,
}

impl Operation {
    /// The wire discriminator, used as the routing key by operation handlers.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Set { .. } => "set",
            Operation::Delete { .. } => "delete",
            Operation::Clear { .. } => "clear",
            Operation::CreateSubDirectory { .. } => "createSubDirectory",
            Operation::DeleteSubDirectory { .. } => "deleteSubDirectory",
            Operation::Act { .. } => "act",
            Operation::Unknown => "unknown",
        }
    }

    /// Absolute path the operation addresses, when it carries one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Operation::Set { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Clear { path }
            | Operation::Act { path, .. } => path.as_deref(),
            Operation::CreateSubDirectory { path, .. }
            | Operation::DeleteSubDirectory { path, .. } => Some(path),
            Operation::Unknown => None,
        }
    }

    /// Key the operation addresses, for key-scoped operations.
    pub fn key(&self) -> Option<&str> {
        match self {
            Operation::Set { key, .. }
            | Operation::Delete { key, .. }
            | Operation::Act { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.path(), self.key()) {
            (Some(path), Some(key)) => write!(f, "{}('{}':'{}')", self.kind(), path, key),
            (Some(path), None) => write!(f, "{}('{}')", self.kind(), path),
            (None, Some(key)) => write!(f, "{}('{}')", self.kind(), key),
            (None, None) => write!(f, "{}", self.kind()),
        }
    }
}

/// A message observed on the inbound delta stream, after the ordering service assigned it a
/// position in the total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    /// Per-replica monotonic number assigned at submit time and echoed back here.
    pub client_sequence_number: i64,

    /// Latest sequence number the submitting client had observed when it submitted.
    pub reference_sequence_number: i64,

    /// Server-assigned position in the total order.
    pub sequence_number: i64,

    /// Identity of the submitting client.
    pub client_id: String,

    #[serde(rename = "type")]
    pub message_type: String,

    pub contents: Operation,
}
