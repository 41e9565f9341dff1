//! Errors raised while encoding or decoding protocol envelopes.

/// Failure to turn a request or response envelope into bytes, or back.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The command arguments could not be serialized to a JSON object.
    #[error("failed to encode request: {0}")]
    Encoding(String),
    /// The body is not valid JSON of the expected shape.
    #[error("{0}")]
    Decoding(#[from] serde_json::Error),
    /// The request carried an empty `cmd` field.
    #[error("empty command")]
    EmptyCommand,
}
