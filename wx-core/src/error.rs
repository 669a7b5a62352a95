use thiserror::Error;

/// Crate-wide error type for the ingestion, fan-out, and alarm-evaluation
/// core. Binary entrypoints wrap this in `anyhow` at the edges; internal
/// code always propagates a concrete variant.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("identify missing or invalid: {0}")]
    Identify(String),

    #[error("registry at capacity ({max} connections)")]
    RegistryFull { max: usize },

    #[error("connection id already registered: {0}")]
    DuplicateConnection(uuid::Uuid),

    #[error("log producer error: {0}")]
    Producer(String),

    #[error("log consumer error: {0}")]
    Consumer(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("scheduler is stopped")]
    SchedulerStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
