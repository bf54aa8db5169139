//! Error types for queue operations.

use thiserror::Error;

/// Error reported by the underlying broker client.
///
/// Kept opaque: broker failures are wrapped with the operation that produced
/// them and surfaced verbatim, never interpreted.
pub type BrokerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a message handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to create broker client: {0}")]
    Connection(#[source] BrokerError),

    #[error("error creating stream {stream}: {source}")]
    StreamCreation {
        stream: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to create or update consumer {durable}: {source}")]
    ConsumerCreation {
        durable: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to start consumer {durable}: {source}")]
    ConsumeStart {
        durable: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to publish message to {subject}: {source}")]
    Publish {
        subject: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to close connection: {0}")]
    Close(#[source] BrokerError),

    #[error("queue is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[cfg(feature = "json")]
    #[error("json error: {0}")]
    Json(String),
}

impl QueueError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        QueueError::InvalidArgument(message.into())
    }

    /// Whether the operation was aborted by its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }

    /// Whether the call was rejected before reaching the broker.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, QueueError::InvalidArgument(_))
    }

    /// The broker error this error wraps, if any.
    pub fn broker_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            QueueError::Connection(source)
            | QueueError::Close(source)
            | QueueError::StreamCreation { source, .. }
            | QueueError::ConsumerCreation { source, .. }
            | QueueError::ConsumeStart { source, .. }
            | QueueError::Publish { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Stable error code, suitable for metrics labels and log matching.
    pub fn to_error_code(&self) -> &'static str {
        match self {
            QueueError::InvalidArgument(_) => "INVALID_ARGUMENT",
            QueueError::Connection(_) => "CONNECTION_ERROR",
            QueueError::StreamCreation { .. } => "STREAM_CREATION_ERROR",
            QueueError::ConsumerCreation { .. } => "CONSUMER_CREATION_ERROR",
            QueueError::ConsumeStart { .. } => "CONSUME_START_ERROR",
            QueueError::Publish { .. } => "PUBLISH_ERROR",
            QueueError::Close(_) => "CLOSE_ERROR",
            QueueError::Closed => "QUEUE_CLOSED",
            QueueError::Cancelled => "CANCELLED",
            #[cfg(feature = "json")]
            QueueError::Json(_) => "JSON_ERROR",
        }
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Json(err.to_string())
    }
}
