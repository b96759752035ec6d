//! Failure values produced by service handlers and their normalization into
//! a structured [`RpcError`].
//!
//! Handlers can fail with many shapes of value. Each shape is an explicit
//! variant here, and [`HandlerError::into_rpc_error`] maps it to the error
//! object sent back to the caller.

use super::rpc_error::{error_codes, RpcError};
use crate::types::Value;

/// A failure raised by a registered service handler.
#[derive(Debug)]
pub enum HandlerError {
    /// The handler failed without any value.
    Undefined,
    /// A bare message.
    Message(String),
    /// A numeric application error code.
    Code(i64),
    /// An already-structured error, passed through unchanged.
    Structured(RpcError),
    /// A generic failure object; its message is preserved.
    Failure(anyhow::Error),
    /// Any other value; carried as error data.
    Other(Value),
}

impl HandlerError {
    /// Convenience for `-32602` invalid params failures.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::Structured(RpcError::invalid_params(message))
    }

    /// Normalizes the failure into the error object sent to the caller.
    #[must_use]
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            Self::Undefined => RpcError::internal("undefined error"),
            Self::Message(message) => RpcError::internal(message),
            Self::Code(code) => RpcError::new(code, "application error"),
            Self::Structured(err) => err,
            Self::Failure(err) => {
                RpcError::internal(err.to_string()).with_data(Value::from(format!("{err:#}")))
            }
            Self::Other(value) => {
                RpcError::new(error_codes::INTERNAL_ERROR, "unknown error").with_data(value)
            }
        }
    }
}

impl From<()> for HandlerError {
    fn from((): ()) -> Self {
        Self::Undefined
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<i64> for HandlerError {
    fn from(code: i64) -> Self {
        Self::Code(code)
    }
}

impl From<i32> for HandlerError {
    fn from(code: i32) -> Self {
        Self::Code(i64::from(code))
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self::Structured(err)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failure(err)
    }
}

impl From<Value> for HandlerError {
    fn from(value: Value) -> Self {
        Self::Other(value)
    }
}

impl From<Option<Value>> for HandlerError {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Undefined, Self::Other)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
