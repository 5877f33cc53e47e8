use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use sensornet_domain::{
    BenchmarkMetrics, DomainResult, GetReadingsInput, IotDevice, Registry, SensorDataMessage,
    SensorReading,
};
use sensornet_kafka::{BatchHandler, ConsumerMessage, DropHook};
use sensornet_metrics::IngestMetrics;

use crate::benchmark::BenchmarkTracker;

/// Glues the consumer to storage: decodes batches, persists them in one
/// transactional scope, and keeps the throughput/latency aggregates.
pub struct IotController {
    registry: Arc<dyn Registry>,
    metrics: Arc<IngestMetrics>,
    tracker: BenchmarkTracker,
    run_id: String,
    benchmark_flush: Duration,
    last_benchmark_flush: Mutex<Instant>,
}

impl IotController {
    pub fn new(
        registry: Arc<dyn Registry>,
        metrics: Arc<IngestMetrics>,
        batch_size: usize,
        database_type: String,
        run_id: String,
        benchmark_flush: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            tracker: BenchmarkTracker::new(batch_size, database_type),
            run_id,
            benchmark_flush,
            last_benchmark_flush: Mutex::new(Instant::now()),
        }
    }

    /// Process one batch pulled from a partition claim. Malformed messages
    /// are counted and skipped; the remaining readings persist as a unit.
    pub async fn handle_batch(&self, msgs: Vec<ConsumerMessage>) -> anyhow::Result<()> {
        let started = Instant::now();
        let ingest_time = Utc::now();

        self.metrics.batch_size.set(msgs.len() as f64);
        self.metrics
            .kafka_messages_consumed
            .inc_by(msgs.len() as f64);

        let readings = self.decode_batch(&msgs, ingest_time);
        if readings.is_empty() {
            debug!(run_id = %self.run_id, "no valid readings to process");
            return Ok(());
        }
        let record_count = readings.len();

        let insert_started = Instant::now();
        self.metrics.db_transactions.inc();
        let result = self
            .registry
            .do_in_tx(Box::new(move |r: &dyn Registry| {
                Box::pin(async move { r.iot().batch_insert_readings(&readings).await })
            }))
            .await;

        if let Err(err) = result {
            self.metrics.db_errors.inc();
            return Err(anyhow::Error::new(err).context("failed to process batch"));
        }

        self.metrics
            .db_operation_duration
            .with_label_values(&["batch_insert"])
            .observe(insert_started.elapsed().as_secs_f64());

        let latency = started.elapsed();
        self.metrics
            .batch_processing_duration
            .observe(latency.as_secs_f64());
        self.metrics
            .processing_latency
            .with_label_values(&["batch"])
            .observe(latency.as_secs_f64());
        self.tracker.record_batch(record_count, latency);

        info!(
            run_id = %self.run_id,
            batch_size = record_count,
            latency_ms = latency.as_millis() as u64,
            "processed batch"
        );

        self.maybe_flush_benchmark().await;
        Ok(())
    }

    fn decode_batch(
        &self,
        msgs: &[ConsumerMessage],
        ingest_time: DateTime<Utc>,
    ) -> Vec<SensorReading> {
        let mut readings = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let data = match serde_json::from_slice::<SensorDataMessage>(&msg.value) {
                Ok(data) => data,
                Err(err) => {
                    warn!(
                        run_id = %self.run_id,
                        partition = msg.id.partition,
                        offset = msg.id.offset,
                        error = %err,
                        "skipping malformed message"
                    );
                    self.metrics
                        .messages_processed
                        .with_label_values(&["unknown", "decode_error"])
                        .inc();
                    self.tracker.record_failed(1);
                    continue;
                }
            };

            for (kind, value) in [
                ("temperature", data.temperature),
                ("humidity", data.humidity),
                ("co2", data.co2),
            ] {
                self.metrics
                    .sensor_reading
                    .with_label_values(&[&data.device_id, kind])
                    .set(value);
            }
            self.metrics
                .device_online_status
                .with_label_values(&[&data.device_id, &data.device_type])
                .set(1.0);
            self.metrics
                .messages_processed
                .with_label_values(&[&data.device_id, "success"])
                .inc();

            readings.push(data.into_reading(ingest_time));
        }
        readings
    }

    /// Record a poison message the consumer dropped after bisection.
    pub fn record_dropped(&self, msg: &ConsumerMessage) {
        // The payload is often valid JSON that merely violates a storage
        // constraint; label the counter with the device when decodable.
        let device = serde_json::from_slice::<SensorDataMessage>(&msg.value)
            .map(|m| m.device_id)
            .unwrap_or_else(|_| "unknown".to_string());
        self.metrics
            .messages_processed
            .with_label_values(&[&device, "dropped"])
            .inc();
        self.tracker.record_failed(1);
    }

    /// Persist a benchmark row at most once per flush interval.
    async fn maybe_flush_benchmark(&self) {
        {
            let mut last = self.last_benchmark_flush.lock();
            if last.elapsed() < self.benchmark_flush {
                return;
            }
            *last = Instant::now();
        }

        let snapshot = self.tracker.snapshot();
        if let Err(err) = self.save_benchmark_metrics(&snapshot).await {
            warn!(run_id = %self.run_id, error = %err, "failed to flush benchmark metrics");
        }
    }

    pub fn metrics_snapshot(&self) -> BenchmarkMetrics {
        self.tracker.snapshot()
    }

    pub async fn get_devices(&self) -> DomainResult<Vec<IotDevice>> {
        self.registry.iot().get_devices().await
    }

    pub async fn get_readings(&self, input: &GetReadingsInput) -> DomainResult<Vec<SensorReading>> {
        self.registry.iot().get_readings(input).await
    }

    pub async fn get_readings_by_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> DomainResult<Vec<SensorReading>> {
        let input = GetReadingsInput {
            device_id: Some(device_id.to_string()),
            limit,
            ..Default::default()
        };
        self.registry.iot().get_readings(&input).await
    }

    pub async fn get_readings_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: i64,
    ) -> DomainResult<Vec<SensorReading>> {
        let input = GetReadingsInput {
            start_time: Some(start_time),
            end_time: Some(end_time),
            limit,
            ..Default::default()
        };
        self.registry.iot().get_readings(&input).await
    }

    pub async fn get_latest_readings(&self) -> DomainResult<Vec<SensorReading>> {
        self.registry.iot().get_latest_readings().await
    }

    pub async fn get_benchmark_metrics(&self, limit: i64) -> DomainResult<Vec<BenchmarkMetrics>> {
        self.registry.iot().get_benchmark_metrics(limit).await
    }

    pub async fn save_benchmark_metrics(&self, metrics: &BenchmarkMetrics) -> DomainResult<()> {
        metrics.validate()?;
        self.registry.iot().save_benchmark_metrics(metrics).await?;
        debug!(
            total = metrics.total_records,
            processed = metrics.processed_records,
            failed = metrics.failed_records,
            "saved benchmark metrics"
        );
        Ok(())
    }
}

/// Handler closure the batch consumer drives.
pub fn batch_handler(controller: Arc<IotController>) -> BatchHandler {
    Arc::new(move |msgs| {
        let controller = Arc::clone(&controller);
        Box::pin(async move {
            controller
                .handle_batch(msgs)
                .await
                .context("handling batch")
        })
    })
}

/// Drop hook feeding the failure counters.
pub fn drop_hook(controller: Arc<IotController>) -> DropHook {
    Arc::new(move |msg| controller.record_dropped(msg))
}
