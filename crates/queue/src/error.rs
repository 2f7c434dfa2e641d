/// Errors raised by queue transports.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Startup configuration does not allow building the transport.
    #[error("queue configuration error: {0}")]
    Config(String),

    /// The broker could not be reached or rejected a command.
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command failed")]
    Broker(#[from] redis::RedisError),

    /// A job or event could not be encoded or decoded.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// A stream entry did not carry the expected fields.
    #[error("malformed queue entry {id}: {reason}")]
    Malformed { id: String, reason: String },
}
