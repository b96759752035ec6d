//! `Tether` Core: topic scheme, JSON-RPC envelopes, and wire codecs for
//! request/response and event semantics over topic pub/sub.

pub mod codec;
pub mod messages;
pub mod topic;
pub mod types;

pub use codec::{Codec, CodecError, CodecFormat, JsonCodec, MsgPackCodec, Payload};
pub use messages::{error_codes, Envelope, EnvelopeError, HandlerError, RpcError};
pub use topic::{DefaultTopicScheme, TopicError, TopicFamily, TopicMatch, TopicScheme};
pub use types::{ClientId, RequestId, Value};
