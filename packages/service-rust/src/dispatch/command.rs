//! Parsed commands, handler replies, and the errors both sides can produce.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use switchyard_core::{
    decode_request, CorrelationId, ErrorResponse, ProtocolError, DISPATCHER_CONTEXT,
};

use crate::transport::Delivery;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A request after parsing, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    /// Command-specific arguments (`{}` when the request carried none).
    pub arguments: Value,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
}

impl Command {
    /// A command with no arguments and no routing metadata.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Value::Object(serde_json::Map::new()),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Replaces the arguments object.
    #[must_use]
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    /// Deserializes the arguments into a handler-defined shape.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::InvalidArguments` if the arguments do not match `T`.
    pub fn arguments<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.arguments.clone())
            .map_err(|e| HandlerError::InvalidArguments(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// CommandParser
// ---------------------------------------------------------------------------

/// Why a delivery could not be turned into a [`Command`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Turns a raw delivery into a routable command.
///
/// Swappable by the host service without touching the dispatch loop.
pub trait CommandParser: Send + Sync {
    /// # Errors
    ///
    /// Returns `ParseError` when the delivery is not a valid request.
    fn parse(&self, delivery: &Delivery) -> Result<Command, ParseError>;
}

/// Parses `{"cmd": ..., ...arguments}` JSON bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCommandParser;

impl CommandParser for JsonCommandParser {
    fn parse(&self, delivery: &Delivery) -> Result<Command, ParseError> {
        let request = decode_request(&delivery.body)?;
        Ok(Command {
            arguments: request.arguments_value(),
            name: request.cmd,
            correlation_id: delivery
                .properties
                .correlation_id
                .clone()
                .map(CorrelationId::from),
            reply_to: delivery.properties.reply_to.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Successful handler result.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Zero-length body.
    Empty,
    Json(Value),
    /// Pre-encoded body, sent as is.
    Raw(Bytes),
}

impl Reply {
    /// Serializes `value` into a JSON reply.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::Internal` if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, HandlerError> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| HandlerError::Internal(e.into()))
    }

    /// The bytes sent back to the requester.
    #[must_use]
    pub fn into_body(self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Json(value) => Bytes::from(value.to_string()),
            Self::Raw(bytes) => bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Failure of a routed command. Every variant becomes an error envelope.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{message}")]
    Failed { message: String, context: String },
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    /// A handler-defined failure reported under `context`.
    #[must_use]
    pub fn failed(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Component name reported in the error envelope.
    #[must_use]
    pub fn context(&self) -> &str {
        match self {
            Self::Failed { context, .. } => context,
            _ => DISPATCHER_CONTEXT,
        }
    }

    /// The error envelope sent back for this failure.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.to_string(), self.context())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::transport::MessageProperties;

    fn delivery(body: &str) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "svc".to_string(),
            redelivered: false,
            properties: MessageProperties::with_content_type("application/json")
                .correlation_id("corr-1")
                .reply_to("amq.gen-reply"),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[test]
    fn json_parser_extracts_command_and_routing() {
        let command = JsonCommandParser
            .parse(&delivery(r#"{"cmd":"lookup","id":3}"#))
            .unwrap();
        assert_eq!(command.name, "lookup");
        assert_eq!(command.arguments, json!({"id": 3}));
        assert_eq!(command.correlation_id, Some(CorrelationId::from("corr-1")));
        assert_eq!(command.reply_to.as_deref(), Some("amq.gen-reply"));
    }

    #[test]
    fn json_parser_rejects_invalid_json() {
        let err = JsonCommandParser.parse(&delivery("{oops")).unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn json_parser_rejects_missing_command() {
        let err = JsonCommandParser.parse(&delivery(r#"{"id":3}"#)).unwrap_err();
        assert!(err.to_string().contains("cmd"));
    }

    #[test]
    fn typed_arguments() {
        #[derive(Deserialize)]
        struct Lookup {
            id: u32,
        }

        let command = Command::new("lookup").with_arguments(json!({"id": 9}));
        assert_eq!(command.arguments::<Lookup>().unwrap().id, 9);

        let bad = Command::new("lookup").with_arguments(json!({"id": "nine"}));
        assert!(matches!(
            bad.arguments::<Lookup>(),
            Err(HandlerError::InvalidArguments(_))
        ));
    }

    #[test]
    fn reply_bodies() {
        assert!(Reply::Empty.into_body().is_empty());
        assert_eq!(
            Reply::json(&json!({"a": 1})).unwrap().into_body(),
            Bytes::from_static(br#"{"a":1}"#)
        );
        assert_eq!(
            Reply::Raw(Bytes::from_static(b"raw")).into_body(),
            Bytes::from_static(b"raw")
        );
    }

    #[test]
    fn unknown_command_error_response() {
        let response = HandlerError::UnknownCommand("bogus".to_string()).to_response();
        assert_eq!(response, ErrorResponse::unknown_command("bogus"));
    }

    #[test]
    fn failed_error_keeps_handler_context() {
        let err = HandlerError::failed("disk full", "Archive writer");
        let response = err.to_response();
        assert_eq!(response.error, "disk full");
        assert_eq!(response.context, "Archive writer");
    }
}
