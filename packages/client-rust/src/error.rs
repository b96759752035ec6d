//! Client error taxonomy.

use tether_core::{CodecError, RpcError, TopicError};

use crate::transport::TransportError;

/// Errors returned by client operations and reported on the background
/// error channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("handler already registered: {name}")]
    AlreadyRegistered { name: String },
    #[error("no handler registered: {name}")]
    NotRegistered { name: String },
    #[error("invalid topic component: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("call to {name} timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("remote error: {0}")]
    Remote(#[from] RpcError),
    #[error("request id {id:?} carries no client id; response cannot be routed")]
    Unroutable { id: String },
    #[error("subscription count for {topic} would drop below zero")]
    SubscriptionUnderflow { topic: String },
    #[error("no tokio runtime available to serve {name}")]
    NoRuntime { name: String },
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Whether the callee answered that no service is registered.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Remote(err) if err.is_method_not_found())
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The remote error record, if the callee answered with one.
    #[must_use]
    pub fn remote(&self) -> Option<&RpcError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}
