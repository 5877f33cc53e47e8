mod config;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use config::ServiceConfig;
use ingest_worker::{batch_handler, drop_hook, IotController};
use sensornet_kafka::{BatchConsumer, ConsumerConfig, RetryPolicy};
use sensornet_metrics::IngestMetrics;
use sensornet_runner::Runner;

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    telemetry::init(&config.log_level);

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let run_id = telemetry::new_run_id();
    info!(
        run_id = %run_id,
        backend = config.storage.db_backend.database_type(),
        topic = %config.iot_topic,
        batch_size = config.batch_size,
        "starting sensornet ingest service"
    );

    let metrics = match IngestMetrics::new(&config.metrics_addr) {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!(error = format!("{e:#}"), "failed to build metrics registry");
            std::process::exit(1);
        }
    };
    if let Err(e) = metrics.start().await {
        error!(error = format!("{e:#}"), "failed to start metrics server");
        std::process::exit(1);
    }

    let registry = match sensornet_storage::connect(&config.storage).await {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = format!("{e:#}"), "failed to initialize storage");
            std::process::exit(1);
        }
    };

    let controller = Arc::new(IotController::new(
        registry,
        Arc::clone(&metrics),
        config.batch_size,
        config.storage.db_backend.database_type().to_string(),
        run_id.clone(),
        Duration::from_secs(config.benchmark_flush_secs),
    ));

    let consumer = match BatchConsumer::new(
        ConsumerConfig {
            broker: config.kafka_broker.clone(),
            topic: config.iot_topic.clone(),
            group_id: config.consumer_group.clone(),
            batch_size: config.batch_size,
            batch_timeout: Duration::from_secs(config.batch_timeout),
            retry: RetryPolicy::default(),
            run_id: run_id.clone(),
        },
        batch_handler(Arc::clone(&controller)),
    ) {
        Ok(consumer) => Arc::new(consumer.with_drop_hook(drop_hook(Arc::clone(&controller)))),
        Err(e) => {
            error!(error = format!("{e:#}"), "failed to initialize kafka consumer");
            std::process::exit(1);
        }
    };

    let runner = Runner::new()
        .with_named_process("kafka_consumer", {
            let consumer = Arc::clone(&consumer);
            move |ctx| async move { consumer.consume(ctx).await }
        })
        .with_closer({
            let consumer = Arc::clone(&consumer);
            let metrics = Arc::clone(&metrics);
            move || async move {
                consumer.close();
                metrics.stop();
                info!("cleanup complete");
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(10));

    std::process::exit(runner.run().await);
}
