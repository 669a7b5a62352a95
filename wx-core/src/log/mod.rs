//! Partitioned-log producer/consumer contracts. The core depends only on
//! these traits (per the teacher's pattern of treating the broker as an
//! external collaborator behind a narrow port); `kafka` is the only
//! implementation shipped here, backed by `rdkafka`.

pub mod kafka;

use async_trait::async_trait;

use crate::error::Result;

/// A record fetched from a topic, carrying enough identity to commit its
/// offset later.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
    Lz4,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    /// Maps the `WX_PRODUCER_COMPRESSION` env value onto a variant,
    /// defaulting to `Snappy` for anything unrecognized.
    pub fn from_config_str(s: &str) -> Self {
        match s {
            "none" => Compression::None,
            "lz4" => Compression::Lz4,
            "gzip" => Compression::Gzip,
            "zstd" => Compression::Zstd,
            _ => Compression::Snappy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    None,
    Leader,
    All,
}

impl RequiredAcks {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredAcks::None => "0",
            RequiredAcks::Leader => "1",
            RequiredAcks::All => "all",
        }
    }

    /// Maps the `WX_PRODUCER_REQUIRED_ACKS` env value onto a variant,
    /// defaulting to `Leader` for anything unrecognized.
    pub fn from_config_str(s: &str) -> Self {
        match s {
            "none" => RequiredAcks::None,
            "all" => RequiredAcks::All,
            _ => RequiredAcks::Leader,
        }
    }
}

/// Producer configuration, mirroring the ingestion spec's tunables.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub brokers: String,
    pub batch_size: usize,
    pub batch_timeout: std::time::Duration,
    pub batch_bytes: usize,
    pub compression: Compression,
    pub is_async: bool,
    pub required_acks: RequiredAcks,
    pub max_attempts: u32,
    pub read_timeout: std::time::Duration,
    pub write_timeout: std::time::Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".into(),
            batch_size: 100,
            batch_timeout: std::time::Duration::from_millis(100),
            batch_bytes: 1024 * 1024,
            compression: Compression::Snappy,
            is_async: true,
            required_acks: RequiredAcks::Leader,
            max_attempts: 3,
            read_timeout: std::time::Duration::from_secs(30),
            write_timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Publish `(key, value)` pairs to a named topic, partitioned by hash of
/// the key so per-key ordering is preserved. In async mode, `publish`
/// returns once the record is enqueued; broker failures are logged, not
/// surfaced. In sync mode `publish` waits for the durability level given
/// by `required_acks`.
#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<()>;
}

/// A consumer group member. `fetch` blocks (cancellable via `cancel`)
/// until the next record is available and returns at most one record;
/// `commit` acknowledges a specific previously-fetched record. Offsets
/// are never auto-committed.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn fetch(&self, cancel: &tokio_util::sync::CancellationToken) -> Result<Option<ConsumedRecord>>;
    async fn commit(&self, record: &ConsumedRecord) -> Result<()>;
}
