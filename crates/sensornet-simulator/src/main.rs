mod config;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::SimulatorServiceConfig;
use sensornet_kafka::SyncProducer;
use sensornet_metrics::IngestMetrics;
use simulator_worker::{Simulator, SimulatorConfig};

#[tokio::main]
async fn main() {
    let config = match SimulatorServiceConfig::from_env() {
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

    info!(
        backend = config.storage.db_backend.database_type(),
        topic = %config.iot_topic,
        rate = config.producer_rate,
        run_secs = config.simulator_run_secs,
        "starting sensornet simulator"
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

    let devices = match registry.iot().get_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            error!(error = %e, "failed to load device list");
            std::process::exit(1);
        }
    };

    let producer = match SyncProducer::new(&config.kafka_broker) {
        Ok(producer) => Arc::new(producer),
        Err(e) => {
            error!(error = format!("{e:#}"), "failed to initialize kafka producer");
            std::process::exit(1);
        }
    };

    let simulator = Simulator::new(
        Arc::clone(&producer) as Arc<dyn simulator_worker::ReadingPublisher>,
        SimulatorConfig {
            topic: config.iot_topic.clone(),
            rate: config.producer_rate,
            interval: Duration::from_secs(1),
        },
    )
    .with_metrics(Arc::clone(&metrics));

    // Bounded run: cancel on signal or when the run duration elapses.
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal");
            signal_token.cancel();
        }
    });
    let deadline_token = token.clone();
    let run_duration = Duration::from_secs(config.simulator_run_secs);
    tokio::spawn(async move {
        tokio::time::sleep(run_duration).await;
        info!("run duration elapsed");
        deadline_token.cancel();
    });

    let exit_code = match simulator.run(devices, token).await {
        Ok(summary) => {
            info!(
                messages_sent = summary.sent,
                send_errors = summary.errors,
                throughput_avg_rps = summary.throughput,
                "simulation complete"
            );
            0
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "simulation failed");
            1
        }
    };

    if let Err(e) = producer.close() {
        error!(error = format!("{e:#}"), "failed to flush producer");
    }
    metrics.stop();

    std::process::exit(exit_code);
}
