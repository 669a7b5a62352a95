//! Alarm evaluation daemon: consumes the raw-metric topic as a member of
//! the alarming consumer group, evaluates every active threshold per
//! sample, and emits alarm-lifecycle events. Wires components F
//! (consumer), H (alarm state machine), and I (event emitter).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wx_config::Config;
use wx_core::alarm::AlarmEvaluator;
use wx_core::cache::StateCache;
use wx_core::db::Database;
use wx_core::log::kafka::{KafkaConsumer, KafkaProducer};
use wx_core::log::{Compression, ConsumedRecord, LogConsumer, LogProducer, ProducerConfig, RequiredAcks};
use wx_core::model::RawSample;
use wx_core::server::RAW_METRIC_TOPIC;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "wx_server=info,wx_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("wx-alarmd configuration loaded");

    let db = Arc::new(Database::connect(&config.database_url).await?);
    let cache = Arc::new(StateCache::connect(&config.redis_url).await?);
    let producer_config = ProducerConfig {
        brokers: config.kafka_brokers.clone(),
        batch_size: config.producer.batch_size,
        batch_timeout: config.producer.batch_timeout,
        compression: Compression::from_config_str(&config.producer.compression),
        is_async: config.producer.is_async,
        required_acks: RequiredAcks::from_config_str(&config.producer.required_acks),
        max_attempts: config.producer.max_attempts,
        ..ProducerConfig::default()
    };
    let producer = Arc::new(KafkaProducer::new(producer_config)?);
    let consumer = Arc::new(KafkaConsumer::new(
        &config.kafka_brokers,
        &config.alarm.consumer_group,
        RAW_METRIC_TOPIC,
    )?);

    let evaluator = Arc::new(AlarmEvaluator::new(db, cache, producer));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run_handle = tokio::spawn(async move { evaluate_loop(consumer, evaluator, run_cancel).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    run_handle.await?;

    Ok(())
}

/// Evaluates records one at a time, committing the offset only once
/// evaluation succeeds so a database or cache failure redelivers the
/// sample rather than silently skipping an alarm check.
async fn evaluate_loop<P: LogProducer + 'static>(
    consumer: Arc<KafkaConsumer>,
    evaluator: Arc<AlarmEvaluator<P>>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let record = match consumer.fetch(&cancel).await {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "fetch failed, retrying");
                continue;
            }
        };

        if let Err(e) = evaluate_one(&consumer, &evaluator, &record).await {
            error!(error = %e, topic = %record.topic, offset = record.offset, "alarm evaluation failed, leaving offset uncommitted");
        }
    }
}

async fn evaluate_one<P: LogProducer + 'static>(
    consumer: &Arc<KafkaConsumer>,
    evaluator: &Arc<AlarmEvaluator<P>>,
    record: &ConsumedRecord,
) -> wx_core::error::Result<()> {
    let sample: RawSample = serde_json::from_slice(&record.value)?;
    evaluator.evaluate(&sample).await?;
    consumer.commit(record).await
}
