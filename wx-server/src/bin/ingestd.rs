//! TCP ingestion daemon: accepts sensor connections, runs the identify
//! and inactivity protocol, and fans parsed metrics out onto the
//! raw-metric topic. Wires components A (scheduler), B (registry), C
//! (protocol), D (worker-pool server), and E (producer).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wx_config::Config;
use wx_core::log::kafka::KafkaProducer;
use wx_core::log::{Compression, ProducerConfig, RequiredAcks};
use wx_core::scheduler::EventScheduler;
use wx_core::server::{IngestServer, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "wx_server=info,wx_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("wx-ingestd configuration loaded");

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

    let cancel = CancellationToken::new();
    let scheduler = Arc::new(EventScheduler::start(num_cpus::get(), cancel.clone()));

    let server_config = ServerConfig {
        port: config.ingress.port,
        max_connections: config.ingress.max_connections,
        identify_timeout: config.ingress.identify_timeout,
        inactivity_timeout: config.ingress.inactivity_timeout,
        worker_count: config.ingress.worker_count,
        job_queue_size: config.ingress.job_queue_size,
        use_worker_pool: config.ingress.use_worker_pool,
    };
    let server = Arc::new(IngestServer::new(server_config, scheduler.clone(), producer));

    let run_cancel = cancel.clone();
    let run_handle = tokio::spawn(async move { server.run(run_cancel).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    scheduler.stop();
    run_handle.await??;

    Ok(())
}
