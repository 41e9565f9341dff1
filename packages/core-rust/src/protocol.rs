//! Correlation protocol: the wire contract shared by RPC clients and dispatchers.
//!
//! A request is a JSON object `{"cmd": "<name>", ...arguments}` published with a
//! caller-minted correlation token and a reply destination in the message
//! properties. A response is either a command-defined JSON body or the error
//! envelope `{"error": "<message>", "context": "<component>"}`. Nothing on the
//! wire distinguishes the two shapes, so callers check for the error shape with
//! [`decode_error_response`] and treat a decoding failure as "not an error".

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Content type stamped on every request and response.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Context reported in error envelopes produced by the dispatch loop itself.
pub const DISPATCHER_CONTEXT: &str = "Message dispatcher";

// ---------------------------------------------------------------------------
// CorrelationId
// ---------------------------------------------------------------------------

/// Opaque, globally unique token linking a request to its response.
///
/// Minted by the requester per outstanding request and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mints a fresh token backed by a random UUID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The token as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the token, returning its text.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Request envelope
// ---------------------------------------------------------------------------

/// Request envelope: the command name plus command-specific arguments.
///
/// Arguments are flattened into the same JSON object as `cmd`, so a request
/// without arguments is exactly `{"cmd": "<name>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(alias = "Cmd")]
    pub cmd: String,
    #[serde(flatten)]
    pub arguments: Map<String, Value>,
}

impl Request {
    /// Creates a request with no arguments.
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            arguments: Map::new(),
        }
    }

    /// Arguments as a JSON value (`{}` when none were supplied).
    #[must_use]
    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// Mints a correlation token and serializes `{cmd, ...arguments}`.
///
/// `arguments` must serialize to a JSON object or `null`; its keys are merged
/// next to `cmd`.
///
/// # Errors
///
/// Returns `ProtocolError::EmptyCommand` for an empty command and
/// `ProtocolError::Encoding` when the arguments are not serializable, are not
/// an object, or try to override the `cmd` key.
pub fn encode_request<A: Serialize + ?Sized>(
    command: &str,
    arguments: &A,
) -> Result<(CorrelationId, Vec<u8>), ProtocolError> {
    if command.is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }
    let arguments = match serde_json::to_value(arguments)
        .map_err(|e| ProtocolError::Encoding(e.to_string()))?
    {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ProtocolError::Encoding(format!(
                "arguments must be a JSON object, got {other}"
            )))
        }
    };
    if arguments.contains_key("cmd") {
        return Err(ProtocolError::Encoding(
            "arguments must not contain the reserved `cmd` key".to_string(),
        ));
    }

    let request = Request {
        cmd: command.to_string(),
        arguments,
    };
    let body = serde_json::to_vec(&request).map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    Ok((CorrelationId::new(), body))
}

/// Shortcut for [`encode_request`] with no arguments.
///
/// # Errors
///
/// Returns `ProtocolError::EmptyCommand` when `command` is empty.
pub fn encode_command(command: &str) -> Result<(CorrelationId, Vec<u8>), ProtocolError> {
    encode_request(command, &Value::Null)
}

/// Parses a request body and validates that the command is present.
///
/// # Errors
///
/// Returns `ProtocolError::Decoding` for malformed JSON or a missing `cmd`
/// field, and `ProtocolError::EmptyCommand` when `cmd` is empty.
pub fn decode_request(body: &[u8]) -> Result<Request, ProtocolError> {
    let request: Request = serde_json::from_slice(body)?;
    if request.cmd.is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }
    Ok(request)
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Failure record returned in place of a command's success payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: String,
    pub context: String,
}

impl ErrorResponse {
    /// An envelope reporting `error` from the component named `context`.
    #[must_use]
    pub fn new(error: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            context: context.into(),
        }
    }

    /// Error envelope for a command no handler is registered for.
    #[must_use]
    pub fn unknown_command(command: &str) -> Self {
        Self::new(format!("Unknown command: {command}"), DISPATCHER_CONTEXT)
    }

    /// Serializes the envelope as `{"error":..,"context":..}`, in that order.
    /// Field values are JSON-escaped.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Two string fields always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Attempts to read a response body as the error envelope.
///
/// Success payloads normally fail this check; callers expecting a typed
/// payload should treat the error as "not an error response".
///
/// # Errors
///
/// Returns `ProtocolError::Decoding` if the body is not a JSON object with
/// exactly the string fields `error` and `context`.
pub fn decode_error_response(body: &[u8]) -> Result<ErrorResponse, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}

/// A response body classified as success or error envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success(Vec<u8>),
    Error(ErrorResponse),
}

impl Response {
    /// Classifies a reply body; anything not shaped like an error envelope is a success.
    #[must_use]
    pub fn from_body(body: Vec<u8>) -> Self {
        match decode_error_response(&body) {
            Ok(err) => Self::Error(err),
            Err(_) => Self::Success(body),
        }
    }

    /// `true` for an error envelope.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
