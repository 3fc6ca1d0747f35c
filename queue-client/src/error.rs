//! Error type for the queue client.
//!
//! Every failure a caller can observe is a [`ClientError`]. The variants follow
//! the failure classes of the engine:
//! - configuration problems (bad arguments, unknown endpoint, oversized file)
//!   surface synchronously from `Client::submit`, before any network I/O;
//! - transport and protocol failures surface as a failed job result;
//! - `QueueFull` is the only condition worth retrying as-is;
//! - `App` is an ordinary outcome: the remote function itself raised.
//!
//! The type is `Clone` because a job keeps its terminal result and hands it
//! out on every `Job::result` call.

use thiserror::Error;

/// Generic "the remote raised but did not tell us why" message.
pub const HIDDEN_APP_ERROR: &str = "The upstream app has raised an exception but has not enabled \
verbose error reporting. To enable, set show_error=True in launch().";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// Bad arguments, unknown endpoints or components, invalid options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The selected endpoint has been disabled by the remote app.
    #[error("This endpoint has been disabled by the remote app")]
    InvalidEndpoint,

    #[error("File {path} is {size} bytes and exceeds the maximum file size of {max} bytes")]
    FileTooLarge { path: String, size: u64, max: u64 },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Too many requests to the API, please try again later")]
    TooManyRequests,

    /// Connection refused, reset, or timed out at the transport level.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status other than the ones with a dedicated variant.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The remote queue rejected the submission with a 503.
    #[error("Queue is full! Please try again.")]
    QueueFull,

    /// The remote function raised. `data` keeps any extra fields the server sent.
    #[error("{message}")]
    App {
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Unrecognized message, malformed frame, or missing field.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The shared stream went away while this job was still waiting on it.
    #[error("Event stream closed before the job completed: {0}")]
    StreamClosed(String),

    #[error("Server stopped unexpectedly")]
    ServerStopped,

    /// The session was reset while the job was in flight.
    #[error("Session was reset while the job was in flight")]
    SessionReset,

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Timed out waiting for the job result")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn is_queue_full(&self) -> bool {
        matches!(self, ClientError::QueueFull)
    }

    /// Whether resubmitting the same call unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::QueueFull | ClientError::TooManyRequests)
    }

    pub fn is_remote_app_error(&self) -> bool {
        matches!(self, ClientError::App { .. })
    }

    /// Build an application error from a terminal payload's `error` field.
    pub(crate) fn from_app_payload(error: &serde_json::Value, rest: serde_json::Value) -> Self {
        let message = match error {
            serde_json::Value::Null => HIDDEN_APP_ERROR.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let data = match &rest {
            serde_json::Value::Object(map) if map.is_empty() => None,
            serde_json::Value::Null => None,
            _ => Some(rest),
        };
        ClientError::App { message, data }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ClientError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => ClientError::Transport(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_full_is_distinct_from_transport() {
        let full = ClientError::QueueFull;
        let transport = ClientError::Transport("connection reset".to_string());

        assert!(full.is_queue_full());
        assert!(full.is_retryable());
        assert!(!transport.is_queue_full());
        assert!(!transport.is_retryable());
    }

    #[test]
    fn test_app_error_without_detail_uses_generic_message() {
        let err = ClientError::from_app_payload(&serde_json::Value::Null, json!({}));
        assert_eq!(err.to_string(), HIDDEN_APP_ERROR);
        assert!(err.is_remote_app_error());
    }

    #[test]
    fn test_app_error_keeps_extra_fields() {
        let err = ClientError::from_app_payload(&json!("division by zero"), json!({"title": "Oops"}));
        match err {
            ClientError::App { message, data } => {
                assert_eq!(message, "division by zero");
                assert_eq!(data, Some(json!({"title": "Oops"})));
            }
            other => panic!("Expected App error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::FileTooLarge {
            path: "a.bin".to_string(),
            size: 20,
            max: 10,
        };
        assert_eq!(
            err.to_string(),
            "File a.bin is 20 bytes and exceeds the maximum file size of 10 bytes"
        );
        assert_eq!(ClientError::QueueFull.to_string(), "Queue is full! Please try again.");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ClientError = io.into();
        assert!(matches!(err, ClientError::Io(_)));
    }
}
