use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use ingest_worker::IotController;
use sensornet_domain::{
    BenchmarkMetrics, DomainError, DomainResult, GetReadingsInput, IotDevice, IotRepository,
    Registry, SensorReading, TxCallback, UserRepository,
};
use sensornet_kafka::{ConsumerMessage, MessageId};
use sensornet_metrics::IngestMetrics;

#[derive(Clone, Default)]
struct InMemoryIotRepository {
    readings: Arc<Mutex<Vec<SensorReading>>>,
    benchmarks: Arc<Mutex<Vec<BenchmarkMetrics>>>,
    fail_inserts: Arc<AtomicBool>,
}

#[async_trait]
impl IotRepository for InMemoryIotRepository {
    async fn get_devices(&self) -> DomainResult<Vec<IotDevice>> {
        Ok(Vec::new())
    }

    async fn get_readings(&self, input: &GetReadingsInput) -> DomainResult<Vec<SensorReading>> {
        let mut readings: Vec<SensorReading> = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                input
                    .device_id
                    .as_ref()
                    .map(|d| &r.device_id == d)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(readings)
    }

    async fn get_latest_readings(&self) -> DomainResult<Vec<SensorReading>> {
        Ok(Vec::new())
    }

    async fn batch_insert_readings(&self, readings: &[SensorReading]) -> DomainResult<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(DomainError::RepositoryError(anyhow::anyhow!(
                "storage unavailable"
            )));
        }
        self.readings.lock().unwrap().extend_from_slice(readings);
        Ok(())
    }

    async fn save_benchmark_metrics(&self, metrics: &BenchmarkMetrics) -> DomainResult<()> {
        self.benchmarks.lock().unwrap().push(metrics.clone());
        Ok(())
    }

    async fn get_benchmark_metrics(&self, _limit: i64) -> DomainResult<Vec<BenchmarkMetrics>> {
        Ok(self.benchmarks.lock().unwrap().clone())
    }
}

struct InMemoryRegistry {
    iot: InMemoryIotRepository,
    in_tx: bool,
}

impl InMemoryRegistry {
    fn new(iot: InMemoryIotRepository) -> Self {
        Self { iot, in_tx: false }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    fn iot(&self) -> &dyn IotRepository {
        &self.iot
    }

    fn user(&self) -> Option<&dyn UserRepository> {
        None
    }

    async fn do_in_tx(&self, f: TxCallback) -> DomainResult<()> {
        if self.in_tx {
            return Err(DomainError::NestedTransaction);
        }
        let child = InMemoryRegistry {
            iot: self.iot.clone(),
            in_tx: true,
        };
        f(&child).await
    }
}

fn message(offset: i64, payload: &[u8]) -> ConsumerMessage {
    ConsumerMessage {
        id: MessageId {
            topic: "iot-readings".to_string(),
            partition: 0,
            offset,
            key: format!("k-{offset}"),
        },
        value: payload.to_vec(),
        headers: HashMap::new(),
    }
}

fn reading_payload(device_id: &str, second: u32) -> Vec<u8> {
    let timestamp = Utc
        .with_ymd_and_hms(2024, 1, 15, 10, 0, second)
        .unwrap()
        .to_rfc3339();
    serde_json::to_vec(&serde_json::json!({
        "device_id": device_id,
        "device_name": "Lobby-T",
        "device_type": "temperature",
        "location": "HQ",
        "floor": 1,
        "zone": 2,
        "temperature": 23.4,
        "humidity": 48.1,
        "co2": 612.0,
        "timestamp": timestamp,
    }))
    .unwrap()
}

fn controller_with(
    repo: InMemoryIotRepository,
    benchmark_flush: Duration,
) -> (Arc<IotController>, Arc<IngestMetrics>) {
    let metrics = Arc::new(IngestMetrics::new(":0").unwrap());
    let controller = Arc::new(IotController::new(
        Arc::new(InMemoryRegistry::new(repo)),
        Arc::clone(&metrics),
        100,
        "PostgreSQL".to_string(),
        "test-run".to_string(),
        benchmark_flush,
    ));
    (controller, metrics)
}

#[tokio::test]
async fn happy_batch_persists_all_readings() {
    let repo = InMemoryIotRepository::default();
    let (controller, metrics) = controller_with(repo.clone(), Duration::from_secs(3600));

    let msgs: Vec<ConsumerMessage> = (0..10)
        .map(|i| message(i, &reading_payload("D1", i as u32)))
        .collect();

    controller.handle_batch(msgs).await.unwrap();

    let stored = repo.readings.lock().unwrap();
    assert_eq!(stored.len(), 10);
    assert!(stored.iter().all(|r| r.device_id == "D1"));

    assert_eq!(metrics.batch_processing_duration.get_sample_count(), 1);

    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.processed_records, 10);
    assert_eq!(snapshot.failed_records, 0);
}

#[tokio::test]
async fn malformed_messages_are_skipped_not_fatal() {
    let repo = InMemoryIotRepository::default();
    let (controller, _metrics) = controller_with(repo.clone(), Duration::from_secs(3600));

    let msgs = vec![
        message(0, &reading_payload("D1", 0)),
        message(1, b"{not json"),
        message(2, &reading_payload("D1", 2)),
    ];

    controller.handle_batch(msgs).await.unwrap();

    assert_eq!(repo.readings.lock().unwrap().len(), 2);
    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.processed_records, 2);
    assert_eq!(snapshot.failed_records, 1);
}

#[tokio::test]
async fn batch_of_only_garbage_is_a_no_op() {
    let repo = InMemoryIotRepository::default();
    let (controller, metrics) = controller_with(repo.clone(), Duration::from_secs(3600));

    let msgs = vec![message(0, b"oops"), message(1, b"")];
    controller.handle_batch(msgs).await.unwrap();

    assert!(repo.readings.lock().unwrap().is_empty());
    // No storage transaction happened.
    assert_eq!(metrics.db_transactions.get(), 0.0);
    assert_eq!(metrics.batch_processing_duration.get_sample_count(), 0);
}

#[tokio::test]
async fn storage_failure_surfaces_and_counts() {
    let repo = InMemoryIotRepository::default();
    repo.fail_inserts.store(true, Ordering::SeqCst);
    let (controller, metrics) = controller_with(repo.clone(), Duration::from_secs(3600));

    let msgs = vec![message(0, &reading_payload("D1", 0))];
    let err = controller.handle_batch(msgs).await.unwrap_err();

    assert!(err.to_string().contains("failed to process batch"));
    assert_eq!(metrics.db_errors.get(), 1.0);
    assert!(repo.readings.lock().unwrap().is_empty());
}

#[tokio::test]
async fn nested_transaction_is_rejected() {
    let registry = InMemoryRegistry::new(InMemoryIotRepository::default());

    let result = registry
        .do_in_tx(Box::new(|outer: &dyn Registry| {
            Box::pin(async move {
                outer
                    .do_in_tx(Box::new(|_inner: &dyn Registry| Box::pin(async { Ok(()) })))
                    .await
            })
        }))
        .await;

    assert!(matches!(result, Err(DomainError::NestedTransaction)));
}

#[tokio::test]
async fn benchmark_record_flushes_after_interval() {
    let repo = InMemoryIotRepository::default();
    // Zero interval flushes on every batch.
    let (controller, _metrics) = controller_with(repo.clone(), Duration::ZERO);

    let msgs = vec![message(0, &reading_payload("D1", 0))];
    controller.handle_batch(msgs).await.unwrap();

    let benchmarks = repo.benchmarks.lock().unwrap();
    assert_eq!(benchmarks.len(), 1);
    assert_eq!(benchmarks[0].processed_records, 1);
    assert_eq!(benchmarks[0].database_type, "PostgreSQL");
    assert!(benchmarks[0].validate().is_ok());
}

#[tokio::test]
async fn dropped_messages_count_against_the_device() {
    let repo = InMemoryIotRepository::default();
    let (controller, metrics) = controller_with(repo, Duration::from_secs(3600));

    controller.record_dropped(&message(7, &reading_payload("D9", 0)));
    controller.record_dropped(&message(8, b"not json"));

    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.failed_records, 2);

    let dropped_for_device = metrics
        .messages_processed
        .with_label_values(&["D9", "dropped"])
        .get();
    assert_eq!(dropped_for_device, 1.0);
    let dropped_unknown = metrics
        .messages_processed
        .with_label_values(&["unknown", "dropped"])
        .get();
    assert_eq!(dropped_unknown, 1.0);
}
