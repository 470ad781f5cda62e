//! Error types for topicq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No destination is registered for the topic. Fatal to the calling
    /// operation, never retried.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Broker connectivity or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transport failure reported by the Postgres-backed driver.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("poison message {message_id}: {attempts} delivery attempts")]
    PoisonMessage { message_id: String, attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error came from the broker connection itself.
    ///
    /// Transport-level failures on `receive`/`acknowledge`/`reject` are the only
    /// errors allowed to terminate a consumer loop.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
