use bytes::Bytes;
use std::any::Any;
use std::fmt;

/// Pluggable wire-payload decoder, referenced only through this interface.
///
/// The dispatcher core never picks a concrete encoding — the surrounding
/// system supplies one (JSON, protobuf, whatever the service registry
/// advertises). Implementations must be pure and thread-safe: `decode` runs
/// on a dispatcher worker, never on the I/O thread.
pub trait Serializer: Send + Sync {
    fn decode(&self, bytes: Bytes) -> Result<Box<dyn Any + Send>, SerializationError>;
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SerializationError(pub String);

impl SerializationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The map from outstanding request IDs to their future/promise, keyed on
/// the wire. An external collaborator: this crate only ever calls
/// `received` once a response has been decoded.
pub trait PendingInvocations: Send + Sync {
    fn received(&self, channel: &crate::channel::TcpChannel, response: DecodedResponse);
}

/// A successfully decoded response payload, handed to the pending-invocation
/// registry. `request_id` is opaque to this crate; it is whatever the
/// decoder extracted from the frame.
pub struct DecodedResponse {
    pub request_id: u64,
    pub payload: Box<dyn Any + Send>,
}

impl fmt::Debug for DecodedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedResponse")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}
