//! Error types for event parsing.

use thiserror::Error;

/// Errors that can occur when parsing queue messages.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The event type discriminant is not a recognized lifecycle kind.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The message body is not valid JSON or lacks required fields.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Malformed(err.to_string())
    }
}
