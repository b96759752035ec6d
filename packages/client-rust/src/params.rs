//! Handler arguments: the ordered parameter list of an envelope plus the
//! routing facts of the invocation.
//!
//! Parameters stay dynamically typed (`Value`) on the wire. Handlers recover
//! concrete types with [`Params::arg`], which validates arity and type and
//! fails with a `-32602` invalid params error the caller receives verbatim.

use serde::de::DeserializeOwned;
use tether_core::{ClientId, HandlerError, Value};

/// Routing facts of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationInfo {
    /// Service or event name the message was addressed to.
    pub name: String,
    /// Calling instance, recovered from the request id. Requests only.
    pub sender: Option<ClientId>,
    /// Addressee segment of the topic when the message was directed.
    pub receiver: Option<String>,
}

/// Ordered parameters passed to a service or event handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    values: Vec<Value>,
    info: InvocationInfo,
}

impl Params {
    #[must_use]
    pub fn new(values: Vec<Value>, info: InvocationInfo) -> Self {
        Self { values, info }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    #[must_use]
    pub fn info(&self) -> &InvocationInfo {
        &self.info
    }

    /// Decodes the parameter at `index` into `T`.
    ///
    /// # Errors
    ///
    /// Returns an invalid params `HandlerError` when the parameter is missing
    /// or does not have the shape of `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.values.get(index).ok_or_else(|| {
            HandlerError::invalid_params(format!(
                "{}: missing parameter {index} (got {})",
                self.info.name,
                self.values.len()
            ))
        })?;
        rmpv::ext::from_value(value.clone()).map_err(|err| {
            HandlerError::invalid_params(format!(
                "{}: parameter {index} has wrong type: {err}",
                self.info.name
            ))
        })
    }

    /// Fails unless exactly `arity` parameters were passed.
    ///
    /// # Errors
    ///
    /// Returns an invalid params `HandlerError` on an arity mismatch.
    pub fn expect_arity(&self, arity: usize) -> Result<(), HandlerError> {
        if self.values.len() == arity {
            Ok(())
        } else {
            Err(HandlerError::invalid_params(format!(
                "{}: expected {arity} parameters, got {}",
                self.info.name,
                self.values.len()
            )))
        }
    }
}

/// Builds a `Vec<Value>` parameter list from expressions convertible with
/// `Value::from`.
///
/// ```
/// use tether_client::params;
/// let params = params![2, "three", true];
/// assert_eq!(params.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($value)),+]
    };
}
