/// Result type returned by every queue, reader and router operation.
pub type MqResult<T> = Result<T, MqError>;

/// Error type a [`MessageHandler`] may return when it fails to process a message. The message is
/// retained for redelivery.
///
/// [`MessageHandler`]: crate::MessageHandler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum MqError {
    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Queue is full, it already holds {max_size} unconsumed messages")]
    QueueFull { max_size: usize },

    #[error(transparent)]
    StateConflict(#[from] StateConflict),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Corrupt record at {location}: {reason}")]
    CorruptRecord { location: String, reason: String },

    #[error("Storage failure: {0}")]
    Storage(StorageError),

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Message handler failed: {0}")]
    Handler(#[source] HandlerError),

    #[error("No route accepted the message")]
    UnhandledMessage,

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("Queue has been closed")]
    Closed,

    #[error("Operation was cancelled")]
    Cancelled,
}

/// A lifecycle transition was requested from a state which does not allow it.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateConflict {
    #[error("Reader is already running")]
    AlreadyStarted,
    #[error("Reader is currently stopping")]
    StopInProgress,
    #[error("Reader is not running")]
    NotRunning,
    #[error("Another lifecycle transition is in progress")]
    TransitionInProgress,
    #[error("Reader has been closed")]
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    #[error("Json conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid utf-8 payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("{stage} produced an empty value")]
    Empty { stage: &'static str },

    #[error("{0}")]
    Custom(String),
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sql")]
    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error("Corrupt record at {location}: {reason}")]
    Corrupt { location: String, reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for MqError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Corrupt { location, reason } => MqError::CorruptRecord { location, reason },
            e => MqError::Storage(e),
        }
    }
}

impl StorageError {
    pub(crate) fn corrupt(location: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt { location: location.into(), reason: reason.to_string() }
    }
}

impl MqError {
    /// Errors which are raised by the backend itself rather than by a single message, and which
    /// are routed to [`MessageHandler::handle_error`].
    ///
    /// [`MessageHandler::handle_error`]: crate::MessageHandler::handle_error
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Storage(_) | Self::CorruptRecord { .. } | Self::Closed)
    }
}
