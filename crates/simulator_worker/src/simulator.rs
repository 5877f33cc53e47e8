use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sensornet_domain::IotDevice;
use sensornet_kafka::{ProducerMessageOptions, SyncProducer};
use sensornet_metrics::IngestMetrics;

use crate::generate::generate_reading;

/// Seam between the simulator and the broker, mockable in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadingPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

#[async_trait]
impl ReadingPublisher for SyncProducer {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.send_message(topic, payload, ProducerMessageOptions::default())
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub topic: String,
    /// Messages emitted per worker per tick.
    pub rate: usize,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorSummary {
    pub sent: u64,
    pub errors: u64,
    pub elapsed: Duration,
    pub throughput: f64,
}

/// Synthetic device traffic generator: one worker task per device, each
/// emitting `rate` readings per tick until cancelled.
pub struct Simulator {
    publisher: Arc<dyn ReadingPublisher>,
    config: SimulatorConfig,
    metrics: Option<Arc<IngestMetrics>>,
}

impl Simulator {
    pub fn new(publisher: Arc<dyn ReadingPublisher>, config: SimulatorConfig) -> Self {
        Self {
            publisher,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fan out one worker per device and run until cancellation. All workers
    /// are joined before the summary is returned.
    pub async fn run(
        &self,
        devices: Vec<IotDevice>,
        token: CancellationToken,
    ) -> Result<SimulatorSummary> {
        if devices.is_empty() {
            bail!("no active devices to simulate");
        }

        info!(
            devices = devices.len(),
            rate = self.config.rate,
            interval_ms = self.config.interval.as_millis() as u64,
            topic = %self.config.topic,
            "starting simulator"
        );

        if let Some(metrics) = &self.metrics {
            metrics.device_count.set(devices.len() as f64);
        }

        let sent = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));
        let started = Instant::now();

        let mut workers = JoinSet::new();
        for device in devices {
            workers.spawn(device_worker(
                device,
                Arc::clone(&self.publisher),
                self.config.clone(),
                self.metrics.clone(),
                Arc::clone(&sent),
                Arc::clone(&errors),
                token.clone(),
            ));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "simulator worker panicked");
            }
        }

        let elapsed = started.elapsed();
        let sent = sent.load(Ordering::SeqCst);
        let errors = errors.load(Ordering::SeqCst);
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            sent as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        info!(
            messages_sent = sent,
            send_errors = errors,
            throughput_avg_rps = throughput,
            "simulator finished"
        );

        Ok(SimulatorSummary {
            sent,
            errors,
            elapsed,
            throughput,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn device_worker(
    device: IotDevice,
    publisher: Arc<dyn ReadingPublisher>,
    config: SimulatorConfig,
    metrics: Option<Arc<IngestMetrics>>,
    sent: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                for _ in 0..config.rate {
                    if token.is_cancelled() {
                        return;
                    }
                    emit_one(&device, publisher.as_ref(), &config, metrics.as_deref(), &sent, &errors)
                        .await;
                }
            }
        }
    }
}

async fn emit_one(
    device: &IotDevice,
    publisher: &dyn ReadingPublisher,
    config: &SimulatorConfig,
    metrics: Option<&IngestMetrics>,
    sent: &AtomicU64,
    errors: &AtomicU64,
) {
    let reading = generate_reading(device);
    let payload = match serde_json::to_vec(&reading) {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, "failed to encode reading");
            errors.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };

    match publisher.publish(&config.topic, &payload).await {
        Ok(()) => {
            if let Some(metrics) = metrics {
                metrics.kafka_messages_produced.inc();
            }
            let total = sent.fetch_add(1, Ordering::SeqCst) + 1;
            if total % 1_000 == 0 {
                info!(total, "simulator progress");
            }
        }
        Err(err) => {
            if let Some(metrics) = metrics {
                metrics.kafka_producer_errors.inc();
            }
            errors.fetch_add(1, Ordering::SeqCst);
            warn!(device_id = %device.device_id, error = %err, "failed to send reading");
        }
    }
}
