//! Batched persistence daemon: drains the raw-metric topic as a member
//! of the db-writer consumer group and writes batches into the
//! relational store. Wires components F (consumer) and G (persistence
//! worker).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wx_config::Config;
use wx_core::db::Database;
use wx_core::log::kafka::KafkaConsumer;
use wx_core::persistence::{BatchedPersistenceWorker, PersistenceConfig};
use wx_core::server::RAW_METRIC_TOPIC;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "wx_server=info,wx_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("wx-dbwriter configuration loaded");

    let db = Arc::new(Database::connect(&config.database_url).await?);
    let consumer = Arc::new(KafkaConsumer::new(
        &config.kafka_brokers,
        &config.persistence.consumer_group,
        RAW_METRIC_TOPIC,
    )?);

    let worker_config = PersistenceConfig {
        batch_size: config.persistence.batch_size,
        flush_interval: config.persistence.flush_interval,
        channel_capacity: config.persistence.channel_capacity,
    };
    let worker = BatchedPersistenceWorker::new(consumer, db, worker_config);

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run_handle = tokio::spawn(async move { worker.run(run_cancel).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    run_handle.await?;

    Ok(())
}
