//! Error taxonomy shared by the connection and session layers.

use crate::ws::protocol::ErrorKind;
use genloop_core::GeneratorError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Socket or transport failure. Retried with backoff.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Explicitly transient failure such as rate limiting.
    #[error("Retryable error: {0}")]
    Retryable(String),
    /// Authentication failure, bad generation id, protocol mismatch, or an
    /// aborted session. Never retried.
    #[error("Non-retryable error: {0}")]
    NonRetryable(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    /// The generator could not complete an iteration.
    #[error("Generator error: {0}")]
    Generator(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl WorkerError {
    /// Whether the connection layer should back off and reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::Connection(_) | WorkerError::Retryable(_) | WorkerError::Timeout(_)
        )
    }

    /// The `kind` reported in a wire `error` frame.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Connection(_) => ErrorKind::ConnectionError,
            WorkerError::Retryable(_) => ErrorKind::RetryableError,
            WorkerError::NonRetryable(_) => ErrorKind::NonRetryableError,
            WorkerError::Timeout(_) => ErrorKind::TimeoutError,
            WorkerError::Generator(_) => ErrorKind::GeneratorError,
            WorkerError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Rebuilds an error from a frame the server sent.
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::ConnectionError => WorkerError::Connection(message),
            ErrorKind::RetryableError => WorkerError::Retryable(message),
            ErrorKind::TimeoutError => WorkerError::Timeout(message),
            ErrorKind::GeneratorError => WorkerError::Generator(message),
            ErrorKind::Cancelled => WorkerError::Cancelled(message),
            ErrorKind::NonRetryableError | ErrorKind::Unknown => WorkerError::NonRetryable(message),
        }
    }
}

impl From<GeneratorError> for WorkerError {
    fn from(err: GeneratorError) -> Self {
        match err {
            GeneratorError::Cancelled => WorkerError::Cancelled(err.to_string()),
            other => WorkerError::Generator(other.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WorkerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    WorkerError::NonRetryable(format!("server rejected credentials ({status})"))
                } else if status.as_u16() == 429 || status.is_server_error() {
                    WorkerError::Retryable(format!("server responded {status}"))
                } else {
                    WorkerError::NonRetryable(format!("server refused upgrade ({status})"))
                }
            }
            WsError::Url(e) => WorkerError::NonRetryable(format!("invalid server url: {e}")),
            other => WorkerError::Connection(other.to_string()),
        }
    }
}
