//! Batched persistence worker (§4.G): drains the raw-metric log into the
//! relational store with bounded latency and bounded batch size,
//! committing offsets only after a successful write. Two cooperating
//! tasks -- a fetch loop pushing onto an internal bounded channel, and a
//! flush loop reacting to batch-size, timer, and shutdown events -- mirror
//! the teacher's split between socket I/O and message processing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::log::{ConsumedRecord, LogConsumer};
use crate::model::RawSample;

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { batch_size: 100, flush_interval: Duration::from_secs(5), channel_capacity: 1000 }
    }
}

/// Drains a single consumer into the relational store. Each worker
/// instance is single-threaded; throughput scales by running more
/// instances in the same consumer group.
pub struct BatchedPersistenceWorker<C: LogConsumer + 'static> {
    consumer: Arc<C>,
    db: Arc<Database>,
    config: PersistenceConfig,
}

impl<C: LogConsumer + 'static> std::fmt::Debug for BatchedPersistenceWorker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedPersistenceWorker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<C: LogConsumer + 'static> BatchedPersistenceWorker<C> {
    pub fn new(consumer: Arc<C>, db: Arc<Database>, config: PersistenceConfig) -> Self {
        Self { consumer, db, config }
    }

    /// Runs until `cancel` fires. Starts the fetch task, then runs the
    /// flush loop on the calling task.
    pub async fn run(self, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);

        let fetch_consumer = self.consumer.clone();
        let fetch_cancel = cancel.clone();
        let fetch_handle = tokio::spawn(async move {
            fetch_loop(fetch_consumer, tx, fetch_cancel).await;
        });

        flush_loop(rx, self.consumer, self.db, self.config, cancel).await;

        let _ = fetch_handle.await;
    }
}

async fn fetch_loop<C: LogConsumer + 'static>(
    consumer: Arc<C>,
    tx: mpsc::Sender<ConsumedRecord>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match consumer.fetch(&cancel).await {
            Ok(Some(record)) => {
                if tx.send(record).await.is_err() {
                    return;
                }
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "fetch failed, retrying on next iteration");
            }
        }
    }
}

async fn flush_loop<C: LogConsumer + 'static>(
    mut rx: mpsc::Receiver<ConsumedRecord>,
    consumer: Arc<C>,
    db: Arc<Database>,
    config: PersistenceConfig,
    cancel: CancellationToken,
) {
    let mut batch: Vec<ConsumedRecord> = Vec::with_capacity(config.batch_size);
    let mut timer = tokio::time::interval(config.flush_interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(pending = batch.len(), "shutdown: flushing remaining batch");
                flush(&db, &consumer, std::mem::take(&mut batch)).await;
                return;
            }

            record = rx.recv() => {
                match record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= config.batch_size {
                            flush(&db, &consumer, std::mem::take(&mut batch)).await;
                        }
                    }
                    None => {
                        flush(&db, &consumer, std::mem::take(&mut batch)).await;
                        return;
                    }
                }
            }

            _ = timer.tick() => {
                if !batch.is_empty() {
                    flush(&db, &consumer, std::mem::take(&mut batch)).await;
                }
            }
        }
    }
}

/// Processes each record in the batch independently, in order. A record
/// whose decode or insert fails is logged and its offset is left
/// uncommitted, so it is redelivered (at-least-once) on restart.
async fn flush<C: LogConsumer + 'static>(db: &Arc<Database>, consumer: &Arc<C>, batch: Vec<ConsumedRecord>) {
    if batch.is_empty() {
        return;
    }
    let n = batch.len();
    for record in batch {
        if let Err(e) = persist_one(db, &record).await {
            error!(error = %e, topic = %record.topic, offset = record.offset, "failed to persist record, leaving offset uncommitted");
            continue;
        }
        if let Err(e) = consumer.commit(&record).await {
            error!(error = %e, offset = record.offset, "failed to commit offset after successful write");
        }
    }
    info!(count = n, "flushed batch");
}

async fn persist_one(db: &Arc<Database>, record: &ConsumedRecord) -> Result<()> {
    let sample: RawSample = serde_json::from_slice(&record.value)?;
    db.upsert_location(&sample.location, &sample.label).await?;
    db.insert_raw_sample(&sample).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::ConsumedRecord;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FakeConsumer {
        records: Mutex<Vec<ConsumedRecord>>,
        committed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl LogConsumer for FakeConsumer {
        async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<ConsumedRecord>> {
            let next = self.records.lock().pop();
            match next {
                Some(r) => Ok(Some(r)),
                None => {
                    // No more synthetic records: block until cancelled,
                    // mirroring a real consumer with nothing to deliver.
                    cancel.cancelled().await;
                    Ok(None)
                }
            }
        }

        async fn commit(&self, record: &ConsumedRecord) -> Result<()> {
            self.committed.lock().push(record.offset);
            Ok(())
        }
    }

    #[test]
    fn persistence_config_defaults_match_spec() {
        let cfg = PersistenceConfig::default();
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.flush_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fetch_loop_forwards_records_then_stops_on_cancel() {
        let consumer = Arc::new(FakeConsumer {
            records: Mutex::new(vec![
                ConsumedRecord { topic: "raw-metric".into(), partition: 0, offset: 2, key: vec![], value: vec![] },
                ConsumedRecord { topic: "raw-metric".into(), partition: 0, offset: 1, key: vec![], value: vec![] },
            ]),
            committed: Mutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let loop_consumer = consumer.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            fetch_loop(loop_consumer, tx, loop_cancel).await;
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(second.offset, 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
