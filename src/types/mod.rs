pub mod directory;
pub mod map;

pub use directory::{SharedDirectory, SubDirectoryRef};
pub use map::SharedMap;

use crate::observer::Observer;
use crate::protocol::{Operation, SequencedMessage, SerializableValue};

/// Observers for everything a shared container can report, delivered in the order state changes:
/// `pre-op`, the mutation, `valueChanged`/`clear`, `op`.
#[derive(Default)]
pub(crate) struct ChannelEvents {
    pub value_changed: Observer<ValueChangedEvent>,
    pub clear: Observer<ClearEvent>,
    pub pre_op: Observer<SequencedMessage>,
    pub op: Observer<SequencedMessage>,
}

/// A locally-issued operation whose echo has not been observed yet. Kept for resubmission on
/// reconnect; retired when the echo arrives.
pub(crate) struct PendingLocalMessage {
    pub client_sequence_number: i64,
    pub op: Operation,
}

/// Payload of the `valueChanged` event, fired after a key mutation lands in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChangedEvent {
    pub key: String,

    /// Serialized projection of the displaced value, when the key held one.
    pub previous_value: Option<SerializableValue>,

    /// Absolute path of the subdirectory the change happened in; `None` for flat maps.
    pub path: Option<String>,
}

/// Payload of the `clear` event, fired after a key-space wipe lands in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ClearEvent {
    /// Absolute path of the wiped subdirectory; `None` for flat maps.
    pub path: Option<String>,
}
