use thiserror::Error;

/// Errors produced by the shared containers.
///
/// Synchronous container operations either succeed, report absence through `Option`/`bool`, or
/// fail with an invalid-argument variant. Errors surfaced from message ingest never mutate state;
/// the host logs them and skips the offending message.
#[derive(Error, Debug)]
pub enum Error {
    /// Keys are non-empty strings.
    #[error("map keys must be non-empty strings")]
    InvalidKey,

    /// Subdirectory names are single path components.
    #[error("'{0}' is not a valid subdirectory name")]
    InvalidSubDirectoryName(String),

    /// A serialized value named a value type that was never registered.
    #[error("no value type registered under '{0}'")]
    UnknownValueType(String),

    /// A value-type operation named an operation its type has no handler for.
    #[error("value type has no handler for operation '{0}'")]
    UnknownValueOperation(String),

    /// A value-type operation targeted a key that holds no value-type value.
    #[error("key '{0}' does not hold a value-type value")]
    NotAValueType(String),

    /// An inbound message carried an operation type no handler is installed for.
    #[error("unrecognized operation type '{0}'")]
    UnknownOperation(String),

    /// A handle reference could not be resolved by the host runtime.
    #[error("handle '{0}' could not be resolved")]
    UnresolvedHandle(String),

    /// A snapshot referenced a blob the storage does not contain.
    #[error("snapshot blob '{0}' is missing")]
    MissingBlob(String),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot blob is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}
