//! Pluggable serialization.
//!
//! Invocation arguments and results travel as [`Value`] trees; the
//! [`Serializer`] decides how whole messages become bytes on the wire.
//! [`JsonSerializer`] is the default.
//!
//! Proxies serialize as their [`AddressableReference`](crate::AddressableReference)
//! (`{"addressable_type": ..., "key": ...}`), so a proxy can be passed as a
//! method argument and rebuilt on the other side with
//! [`AddressableContext::proxy_for`](crate::AddressableContext::proxy_for).

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use serde_json::Value;

use crate::error::CodecError;
use crate::pipeline::Message;

/// Serialization format for messages crossing node boundaries.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// Encode a value to bytes.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes back to a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Deep copy through the wire format.
    ///
    /// Used for loopback delivery so a local call observes the same
    /// isolation as a remote one.
    fn clone_value<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<T, CodecError> {
        let bytes = self.serialize(value)?;
        self.deserialize(&bytes)
    }
}

/// JSON over `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Object-safe view of a [`Serializer`] fixed to [`Message`].
///
/// Lets the pipeline hold `Arc<dyn MessageCodec>` without being generic.
pub(crate) trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;
    fn copy(&self, message: &Message) -> Result<Message, CodecError>;
}

impl<S: Serializer> MessageCodec for S {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        self.serialize(message)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        self.deserialize(bytes)
    }

    fn copy(&self, message: &Message) -> Result<Message, CodecError> {
        self.clone_value(message)
    }
}

/// Convert a typed value into an argument tree.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Convert an argument tree back into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
}
