use thiserror::Error;

#[derive(Error, Debug)]
pub enum QrpcError {
    #[error("broker error: {0}")]
    Broker(String),

    /// Auth or protocol level broker failure. Never retried; terminates the
    /// owning connection or pool.
    #[error("fatal broker error: {0}")]
    Fatal(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("publish rejected by queue admission control")]
    PublishRejected,

    #[error("queue '{0}' already declared with different arguments")]
    QueueMismatch(String),

    #[error("envelope decode error: {0}")]
    Envelope(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QrpcError {
    /// Fatal errors terminate the affected connection or consumer pool
    /// instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QrpcError::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, QrpcError>;
