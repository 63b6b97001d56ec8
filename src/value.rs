use crate::error::Error;
use crate::protocol::{
    SequencedMessage, SerializableValue, ValueTypeOp, VALUE_TYPE_PLAIN, VALUE_TYPE_SHARED,
};
use crate::runtime::SharedHandle;
use async_trait::async_trait;
use serde_json::{json, Value as Json};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Formatter;
use std::sync::{Arc, Weak};

/// Context produced by a value operation's prepare phase and consumed by its process phase.
pub type OpContext = Option<Box<dyn Any + Send>>;

/// A single operation defined by a value type, with the two-phase apply contract.
///
/// `prepare` runs first and may suspend (resolving a handle, fetching referenced state);
/// `process` is synchronous and performs the actual mutation. State is never mutated between the
/// two phases of one message.
#[async_trait]
pub trait ValueOpHandler: Send + Sync {
    /// Materializes whatever context the operation needs before it can apply.
    async fn prepare(
        &self,
        _previous: &dyn ValueTypeInstance,
        _params: &Json,
        _local: bool,
        _message: Option<&SequencedMessage>,
    ) -> Result<OpContext, Error> {
        Ok(None)
    }

    /// Applies the operation to the live instance. Must not suspend.
    fn process(
        &self,
        value: &dyn ValueTypeInstance,
        params: &Json,
        context: OpContext,
        local: bool,
        message: Option<&SequencedMessage>,
    );
}

/// Live counterpart of a registered value type's serialized payload.
///
/// Instances rely on interior mutability: the copy held in container storage and every handle
/// returned from `get` are the same object, so a mutation made through one is visible through
/// all of them.
pub trait ValueTypeInstance: Send + Sync {
    /// Deterministic serialized projection; the round-trip inverse of [ValueType::load].
    fn store(&self) -> Json;

    /// Handler for one of this type's operation names.
    fn op_handler(&self, op_name: &str) -> Option<Arc<dyn ValueOpHandler>>;

    fn as_any(&self) -> &dyn Any;
}

/// A pluggable, named kind of value whose mutations flow through the operation log as `act`
/// operations on the containing map or directory.
pub trait ValueType: Send + Sync {
    /// Registered name; doubles as the wire `type` of serialized values of this kind.
    fn name(&self) -> &str;

    /// Materializes a live instance from its serialized params. The emitter is how the instance
    /// reports its own local mutations back to the containing channel.
    fn load(
        &self,
        params: &Json,
        emitter: ValueOpEmitter,
    ) -> Result<Arc<dyn ValueTypeInstance>, Error>;
}

/// Channel surface the emitter submits through. Implemented by the container internals.
pub(crate) trait ActChannel: Send + Sync {
    /// Submits an `act` operation for `(path, key)` and fires a local `valueChanged`.
    fn emit_act(
        &self,
        key: &str,
        path: Option<&str>,
        previous: SerializableValue,
        op: ValueTypeOp,
    );
}

/// Given to a value-type instance at load time; wraps the `(key, path)` the instance is stored
/// under. Every local mutation of the instance goes through [ValueOpEmitter::emit], which submits
/// an `act` operation on the parent container and fires a local `valueChanged` synchronously.
#[derive(Clone)]
pub struct ValueOpEmitter {
    type_name: Arc<str>,
    key: Arc<str>,
    path: Option<Arc<str>>,
    channel: Weak<dyn ActChannel>,
}

impl ValueOpEmitter {
    pub(crate) fn new(
        type_name: &str,
        key: &str,
        path: Option<&str>,
        channel: Weak<dyn ActChannel>,
    ) -> Self {
        ValueOpEmitter {
            type_name: type_name.into(),
            key: key.into(),
            path: path.map(Into::into),
            channel,
        }
    }

    /// Reports a local mutation the instance already applied to itself. `previous` is the
    /// instance's serialized projection from before the mutation; `params` are the operation's
    /// wire parameters.
    pub fn emit(&self, op_name: &str, previous: Json, params: Json) {
        if let Some(channel) = self.channel.upgrade() {
            let previous = SerializableValue {
                value_type: self.type_name.to_string(),
                value: previous,
            };
            channel.emit_act(
                &self.key,
                self.path.as_deref(),
                previous,
                ValueTypeOp {
                    op_name: op_name.to_string(),
                    value: params,
                },
            );
        }
    }
}

/// A value-type value as held in container storage: the live instance plus the type name it
/// serializes under.
#[derive(Clone)]
pub struct ValueTypeLocalValue {
    pub(crate) type_name: Arc<str>,
    pub(crate) instance: Arc<dyn ValueTypeInstance>,
}

impl ValueTypeLocalValue {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn instance(&self) -> &Arc<dyn ValueTypeInstance> {
        &self.instance
    }
}

/// The in-memory counterpart of a serialized value.
#[derive(Clone)]
pub enum LocalValue {
    /// Raw JSON payload, stored directly.
    Plain(Json),

    /// Handle reference to another shared object. Resolves lazily through the host runtime.
    Shared(SharedHandle),

    /// Live instance of a registered value type, together with its operation handlers.
    ValueType(ValueTypeLocalValue),
}

impl LocalValue {
    /// Deterministic serialized projection of this value; the inverse of
    /// [ValueTypeRegistry::from_serializable].
    pub fn make_serializable(&self) -> SerializableValue {
        match self {
            LocalValue::Plain(value) => SerializableValue {
                value_type: VALUE_TYPE_PLAIN.to_string(),
                value: value.clone(),
            },
            LocalValue::Shared(handle) => SerializableValue {
                value_type: VALUE_TYPE_SHARED.to_string(),
                value: json!({ "url": handle.url }),
            },
            LocalValue::ValueType(value) => SerializableValue {
                value_type: value.type_name.to_string(),
                value: value.instance.store(),
            },
        }
    }

    pub fn as_plain(&self) -> Option<&Json> {
        match self {
            LocalValue::Plain(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&SharedHandle> {
        match self {
            LocalValue::Shared(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_value_type(&self) -> Option<&ValueTypeLocalValue> {
        match self {
            LocalValue::ValueType(value) => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for LocalValue {
    /// Values compare by serialized projection, so converged replicas compare equal even when
    /// they hold distinct live instances.
    fn eq(&self, other: &Self) -> bool {
        self.make_serializable() == other.make_serializable()
    }
}

impl std::fmt::Debug for LocalValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let serializable = self.make_serializable();
        write!(f, "{}({})", serializable.value_type, serializable.value)
    }
}

impl std::fmt::Display for LocalValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.make_serializable().value)
    }
}

impl From<Json> for LocalValue {
    fn from(value: Json) -> Self {
        LocalValue::Plain(value)
    }
}

impl From<SharedHandle> for LocalValue {
    fn from(handle: SharedHandle) -> Self {
        LocalValue::Shared(handle)
    }
}

/// Registry of pluggable value types, keyed by name. Each container instance carries its own
/// registry; registration is not global.
#[derive(Clone, Default)]
pub struct ValueTypeRegistry {
    types: HashMap<String, Arc<dyn ValueType>>,
}

impl ValueTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value type under [ValueType::name]. A second registration under the same name
    /// replaces the first.
    pub fn register(&mut self, value_type: Arc<dyn ValueType>) {
        self.types
            .insert(value_type.name().to_string(), value_type);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ValueType>> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Materializes a serialized value into a local value.
    ///
    /// `Plain` payloads are decoded directly, `Shared` payloads become lazy handle references,
    /// and anything else is looked up here and constructed through its [ValueType::load] factory.
    /// A name with no registration fails with [Error::UnknownValueType].
    pub fn from_serializable(
        &self,
        serializable: &SerializableValue,
        emitter: ValueOpEmitter,
    ) -> Result<LocalValue, Error> {
        match serializable.value_type.as_str() {
            VALUE_TYPE_PLAIN => Ok(LocalValue::Plain(serializable.value.clone())),
            VALUE_TYPE_SHARED => {
                let handle: SharedHandle = serde_json::from_value(serializable.value.clone())?;
                Ok(LocalValue::Shared(handle))
            }
            name => {
                let value_type = self
                    .get(name)
                    .ok_or_else(|| Error::UnknownValueType(name.to_string()))?;
                let instance = value_type.load(&serializable.value, emitter)?;
                Ok(LocalValue::ValueType(ValueTypeLocalValue {
                    type_name: name.into(),
                    instance,
                }))
            }
        }
    }
}
