//! Wire envelopes and error records of the request/response protocol.
//!
//! All envelopes follow JSON-RPC 2.0. The text codec writes them as JSON, the
//! binary codec as named `MsgPack` maps (`rmp_serde::to_vec_named()`) with the
//! same member names, so both formats carry an isomorphic structure.

pub mod envelope;
pub mod handler_error;
pub mod rpc_error;

pub use envelope::{Envelope, EnvelopeError, RawEnvelope, JSONRPC_VERSION};
pub use handler_error::HandlerError;
pub use rpc_error::{error_codes, RpcError};
