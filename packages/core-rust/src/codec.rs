//! Wire codecs: convert envelopes to transport payloads and back.
//!
//! Two formats ship with the crate:
//!
//! - [`JsonCodec`]: text payloads, `serde_json`.
//! - [`MsgPackCodec`]: binary payloads, named `MsgPack` maps via `rmp_serde`.
//!
//! Decoding never yields a partially valid envelope: a payload of the wrong
//! representation, a syntax error, or a structurally invalid object all fail
//! with a [`CodecError`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::messages::{Envelope, RawEnvelope};

/// A message body as carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn representation(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("{format} encode failed: {reason}")]
    Encode {
        format: CodecFormat,
        reason: String,
    },
    #[error("{format} decode failed: {reason}")]
    Decode {
        format: CodecFormat,
        reason: String,
    },
    #[error("{format} codec cannot decode a {found} payload")]
    Representation {
        format: CodecFormat,
        found: &'static str,
    },
    #[error("invalid envelope: {0}")]
    Envelope(#[from] crate::messages::EnvelopeError),
}

impl CodecError {
    /// Whether this error arose on the inbound (decode) path.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        !matches!(self, Self::Encode { .. })
    }
}

/// Envelope encoder/decoder for one wire format.
pub trait Codec: Send + Sync + fmt::Debug {
    fn format(&self) -> CodecFormat;

    /// # Errors
    ///
    /// Returns `CodecError::Encode` when the envelope holds a value the
    /// format cannot represent.
    fn encode(&self, envelope: &Envelope) -> Result<Payload, CodecError>;

    /// # Errors
    ///
    /// Returns a `CodecError` when the payload is of the wrong
    /// representation, malformed, or not a valid envelope.
    fn decode(&self, payload: &Payload) -> Result<Envelope, CodecError>;
}

/// Selects one of the built-in codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecFormat {
    #[default]
    Json,
    MsgPack,
}

impl CodecFormat {
    #[must_use]
    pub fn codec(self) -> Arc<dyn Codec> {
        match self {
            Self::Json => Arc::new(JsonCodec),
            Self::MsgPack => Arc::new(MsgPackCodec),
        }
    }
}

impl fmt::Display for CodecFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        })
    }
}

impl FromStr for CodecFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MsgPack),
            other => Err(format!("unknown codec format: {other}")),
        }
    }
}

/// Text codec writing JSON-RPC objects as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn format(&self) -> CodecFormat {
        CodecFormat::Json
    }

    fn encode(&self, envelope: &Envelope) -> Result<Payload, CodecError> {
        serde_json::to_string(&envelope.to_raw())
            .map(Payload::Text)
            .map_err(|err| CodecError::Encode {
                format: CodecFormat::Json,
                reason: err.to_string(),
            })
    }

    fn decode(&self, payload: &Payload) -> Result<Envelope, CodecError> {
        let Payload::Text(text) = payload else {
            return Err(CodecError::Representation {
                format: CodecFormat::Json,
                found: payload.representation(),
            });
        };
        let raw: RawEnvelope = serde_json::from_str(text).map_err(|err| CodecError::Decode {
            format: CodecFormat::Json,
            reason: err.to_string(),
        })?;
        Ok(Envelope::try_from(raw)?)
    }
}

/// Binary codec writing JSON-RPC objects as named `MsgPack` maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn format(&self) -> CodecFormat {
        CodecFormat::MsgPack
    }

    fn encode(&self, envelope: &Envelope) -> Result<Payload, CodecError> {
        rmp_serde::to_vec_named(&envelope.to_raw())
            .map(Payload::from)
            .map_err(|err| CodecError::Encode {
                format: CodecFormat::MsgPack,
                reason: err.to_string(),
            })
    }

    fn decode(&self, payload: &Payload) -> Result<Envelope, CodecError> {
        let Payload::Binary(bytes) = payload else {
            return Err(CodecError::Representation {
                format: CodecFormat::MsgPack,
                found: payload.representation(),
            });
        };
        let raw: RawEnvelope = rmp_serde::from_slice(bytes).map_err(|err| CodecError::Decode {
            format: CodecFormat::MsgPack,
            reason: err.to_string(),
        })?;
        Ok(Envelope::try_from(raw)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EnvelopeError, RpcError};
    use crate::types::{RequestId, Value};

    fn request() -> Envelope {
        Envelope::Request {
            id: RequestId::from("c1:t1"),
            name: "sum".into(),
            params: vec![Value::from(2), Value::from("x"), Value::Nil],
        }
    }

    #[test]
    fn json_codec_produces_text() {
        let payload = JsonCodec.encode(&request()).unwrap();
        assert!(matches!(payload, Payload::Text(_)));
        assert_eq!(JsonCodec.decode(&payload).unwrap(), request());
    }

    #[test]
    fn msgpack_codec_produces_binary_named_map() {
        let payload = MsgPackCodec.encode(&request()).unwrap();
        let Payload::Binary(bytes) = &payload else {
            panic!("expected binary payload");
        };
        let value: Value = rmp_serde::from_slice(bytes).unwrap();
        let keys: Vec<_> = value
            .as_map()
            .unwrap()
            .iter()
            .filter_map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["jsonrpc", "id", "method", "params"]);
        assert_eq!(MsgPackCodec.decode(&payload).unwrap(), request());
    }

    #[test]
    fn msgpack_preserves_binary_values() {
        let env = Envelope::Success {
            id: RequestId::from("c1:t1"),
            result: Value::Binary(vec![0, 1, 255]),
        };
        let decoded = MsgPackCodec.decode(&MsgPackCodec.encode(&env).unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn text_decoder_rejects_binary_input() {
        let binary = MsgPackCodec.encode(&request()).unwrap();
        assert_eq!(
            JsonCodec.decode(&binary),
            Err(CodecError::Representation {
                format: CodecFormat::Json,
                found: "binary",
            })
        );
    }

    #[test]
    fn binary_decoder_rejects_text_input() {
        let err = MsgPackCodec.decode(&Payload::from("{}")).unwrap_err();
        assert!(matches!(err, CodecError::Representation { found: "text", .. }));
        assert!(err.is_decode());
    }

    #[test]
    fn malformed_json_is_decode_error() {
        let err = JsonCodec.decode(&Payload::from("{not json")).unwrap_err();
        assert!(matches!(err, CodecError::Decode { format: CodecFormat::Json, .. }));
    }

    #[test]
    fn structurally_invalid_envelope_is_rejected() {
        let err = JsonCodec
            .decode(&Payload::from(r#"{"jsonrpc":"2.0","id":"a:b"}"#))
            .unwrap_err();
        assert_eq!(err, CodecError::Envelope(EnvelopeError::EmptyResponse));
    }

    #[test]
    fn unrepresentable_value_is_encode_error() {
        // JSON object keys must be strings or numbers.
        let env = Envelope::Error {
            id: RequestId::from("c1:t1"),
            error: RpcError::internal("x").with_data(Value::Map(vec![(
                Value::Array(vec![]),
                Value::Nil,
            )])),
        };
        let err = JsonCodec.encode(&env).unwrap_err();
        assert!(matches!(err, CodecError::Encode { .. }));
        assert!(!err.is_decode());
        assert!(MsgPackCodec.encode(&env).is_ok());
    }

    #[test]
    fn format_parsing() {
        assert_eq!("json".parse::<CodecFormat>(), Ok(CodecFormat::Json));
        assert_eq!("MsgPack".parse::<CodecFormat>(), Ok(CodecFormat::MsgPack));
        assert!("cbor".parse::<CodecFormat>().is_err());
        assert_eq!(CodecFormat::default().codec().format(), CodecFormat::Json);
    }
}
