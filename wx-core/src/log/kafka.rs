//! `rdkafka`-backed producer and consumer. The broker is an external
//! collaborator (§4.E/§4.F of the design); this module only adapts the
//! `ProducerConfig`/`LogProducer`/`LogConsumer` contracts onto it.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use tracing::{debug, error, warn};

use super::{ConsumedRecord, LogConsumer, LogProducer, ProducerConfig, RequiredAcks};
use crate::error::{Error, Result};

pub struct KafkaProducer {
    producer: FutureProducer,
    config: ProducerConfig,
}

impl std::fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl KafkaProducer {
    pub fn new(config: ProducerConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("compression.type", config.compression.as_str())
            .set("batch.size", config.batch_size.to_string())
            .set("batch.num.messages", config.batch_size.to_string())
            .set("linger.ms", config.batch_timeout.as_millis().to_string())
            .set("message.max.bytes", config.batch_bytes.to_string())
            .set("acks", config.required_acks.as_str())
            .set("message.send.max.retries", config.max_attempts.to_string())
            .set("socket.timeout.ms", config.write_timeout.as_millis().to_string())
            .create()
            .map_err(|e| Error::Producer(format!("failed to build producer: {e}")))?;

        Ok(Self { producer, config })
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(value);

        // `required_acks == None` with `is_async` surfaces only enqueue
        // failures; broker-side failures are logged asynchronously by not
        // awaiting delivery confirmation past enqueue.
        if self.config.is_async {
            match self.producer.send_result(record) {
                Ok(delivery) => {
                    tokio::spawn(async move {
                        if let Err((e, _msg)) = delivery.await {
                            error!(error = %e, "async publish failed after enqueue");
                        }
                    });
                    Ok(())
                }
                Err((e, _record)) => {
                    warn!(error = %e, "publish enqueue failed");
                    Err(Error::Producer(e.to_string()))
                }
            }
        } else {
            self.producer
                .send(record, self.config.write_timeout)
                .await
                .map(|_| ())
                .map_err(|(e, _msg)| {
                    warn!(error = %e, "synchronous publish failed");
                    Error::Producer(e.to_string())
                })
        }
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl std::fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumer").finish_non_exhaustive()
    }
}

impl KafkaConsumer {
    /// Attaches to `topic` as a member of `group`. Offsets are not
    /// auto-committed; the consumer starts at the tail by default.
    pub fn new(brokers: &str, group: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "10000")
            .create()
            .map_err(|e| Error::Consumer(format!("failed to build consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| Error::Consumer(format!("failed to subscribe to {topic}: {e}")))?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn fetch(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Option<ConsumedRecord>> {
        tokio::select! {
            result = self.consumer.recv() => {
                match result {
                    Ok(msg) => {
                        let record = ConsumedRecord {
                            topic: msg.topic().to_string(),
                            partition: msg.partition(),
                            offset: msg.offset(),
                            key: msg.key().unwrap_or_default().to_vec(),
                            value: msg.payload().unwrap_or_default().to_vec(),
                        };
                        debug!(topic = %record.topic, offset = record.offset, "fetched record");
                        Ok(Some(record))
                    }
                    Err(e) => {
                        warn!(error = %e, "consumer fetch error, will retry on next call");
                        Err(Error::Consumer(e.to_string()))
                    }
                }
            }
            _ = cancel.cancelled() => Ok(None),
        }
    }

    async fn commit(&self, record: &ConsumedRecord) -> Result<()> {
        let mut tpl = rdkafka::TopicPartitionList::new();
        tpl.add_partition_offset(
            &record.topic,
            record.partition,
            rdkafka::Offset::Offset(record.offset + 1),
        )
        .map_err(|e| Error::Consumer(format!("invalid offset: {e}")))?;

        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
            .map_err(|e| Error::Consumer(format!("commit failed: {e}")))
    }
}

/// Maps the spec's `required-acks` enum onto rdkafka's string config; kept
/// alongside the producer as a small, independently testable helper.
pub fn acks_literal(acks: RequiredAcks) -> &'static str {
    acks.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_acks_map_to_rdkafka_literals() {
        assert_eq!(acks_literal(RequiredAcks::None), "0");
        assert_eq!(acks_literal(RequiredAcks::Leader), "1");
        assert_eq!(acks_literal(RequiredAcks::All), "all");
    }
}
