//! JSON-RPC 2.0 envelopes exchanged over the topic families.
//!
//! The wire structure is one flat object; the variant is recovered from which
//! members are present:
//!
//! ```text
//! Notification:  {"jsonrpc":"2.0","method":"<name>","params":[...]}
//! Request:       {"jsonrpc":"2.0","id":"<rid>","method":"<name>","params":[...]}
//! Success:       {"jsonrpc":"2.0","id":"<rid>","result":<value>}
//! Error:         {"jsonrpc":"2.0","id":"<rid>","error":{"code":..,"message":..,"data"?:..}}
//! ```

use serde::{Deserialize, Deserializer, Serialize};

use super::rpc_error::RpcError;
use crate::types::{RequestId, Value};

/// Protocol version member required on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Deserializes a field whose presence matters even when its value is
/// `null`: absent -> `None`, `null` -> `Some(Value::Nil)`.
///
/// Without this, serde collapses `"result": null` into an absent field,
/// which would make a successful call returning nothing indistinguishable
/// from a malformed response.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Value::deserialize(deserializer)?))
}

/// Flat wire form shared by all four envelope variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<Vec<Value>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        deserialize_with = "deserialize_present"
    )]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<RpcError>,
}

/// Why a decoded object is not a valid envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unsupported jsonrpc version {0:?}")]
    Version(String),
    #[error("envelope has both result and error")]
    ResultAndError,
    #[error("response envelope has neither result nor error")]
    EmptyResponse,
    #[error("envelope has neither method nor id")]
    Unclassifiable,
    #[error("request or notification carries a result or error member")]
    MixedMembers,
}

/// A classified envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// One-way event; no response is ever produced.
    Notification { name: String, params: Vec<Value> },
    /// Remote call awaiting exactly one response.
    Request {
        id: RequestId,
        name: String,
        params: Vec<Value>,
    },
    Success { id: RequestId, result: Value },
    Error { id: RequestId, error: RpcError },
}

impl Envelope {
    /// Short tag used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Notification { .. } => "notification",
            Self::Request { .. } => "request",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
        }
    }

    /// Request id for requests and responses.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Notification { .. } => None,
            Self::Request { id, .. } | Self::Success { id, .. } | Self::Error { id, .. } => Some(id),
        }
    }

    #[must_use]
    pub fn to_raw(&self) -> RawEnvelope {
        let mut raw = RawEnvelope {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match self {
            Self::Notification { name, params } => {
                raw.method = Some(name.clone());
                raw.params = Some(params.clone());
            }
            Self::Request { id, name, params } => {
                raw.id = Some(id.as_str().to_string());
                raw.method = Some(name.clone());
                raw.params = Some(params.clone());
            }
            Self::Success { id, result } => {
                raw.id = Some(id.as_str().to_string());
                raw.result = Some(result.clone());
            }
            Self::Error { id, error } => {
                raw.id = Some(id.as_str().to_string());
                raw.error = Some(error.clone());
            }
        }
        raw
    }
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Envelope, EnvelopeError> {
        if raw.jsonrpc != JSONRPC_VERSION {
            return Err(EnvelopeError::Version(raw.jsonrpc));
        }
        match (raw.method, raw.id) {
            (Some(name), id) => {
                if raw.result.is_some() || raw.error.is_some() {
                    return Err(EnvelopeError::MixedMembers);
                }
                let params = raw.params.unwrap_or_default();
                Ok(match id {
                    Some(id) => Envelope::Request {
                        id: RequestId::from(id),
                        name,
                        params,
                    },
                    None => Envelope::Notification { name, params },
                })
            }
            (None, Some(id)) => match (raw.result, raw.error) {
                (Some(result), None) => Ok(Envelope::Success {
                    id: RequestId::from(id),
                    result,
                }),
                (None, Some(error)) => Ok(Envelope::Error {
                    id: RequestId::from(id),
                    error,
                }),
                (Some(_), Some(_)) => Err(EnvelopeError::ResultAndError),
                (None, None) => Err(EnvelopeError::EmptyResponse),
            },
            (None, None) => Err(EnvelopeError::Unclassifiable),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
