//! Switchyard core: correlation protocol envelopes and service identity.
//!
//! Transport-independent pieces shared by RPC clients and command dispatchers.

pub mod error;
pub mod identity;
pub mod protocol;

pub use error::ProtocolError;
pub use identity::{build_time, ServiceInfo};
pub use protocol::{
    decode_error_response, decode_request, encode_command, encode_request, CorrelationId,
    ErrorResponse, Request, Response, CONTENT_TYPE_JSON, DISPATCHER_CONTEXT,
};
