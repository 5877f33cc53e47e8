use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "sensornet";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Prometheus metrics for the ingestion pipeline.
///
/// The series set is registered once at construction and never mutates
/// afterwards; handles are cheap clones of the underlying atomics.
pub struct IngestMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // Message counters.
    /// Messages by device and outcome (success/decode_error/dropped).
    pub messages_processed: CounterVec,
    pub kafka_messages_consumed: Counter,
    pub kafka_messages_produced: Counter,
    pub kafka_producer_errors: Counter,

    // Storage counters.
    pub db_transactions: Counter,
    pub db_errors: Counter,

    // Business counters, reserved for ingestion rules.
    pub anomalies_detected: Counter,
    pub alerts_generated: Counter,

    // Gauges.
    pub batch_size: Gauge,
    pub device_online_status: GaugeVec,
    pub sensor_reading: GaugeVec,
    pub tasks_alive: Gauge,
    pub memory_alloc: Gauge,
    pub memory_heap: Gauge,
    pub device_count: Gauge,

    // Histograms.
    pub batch_processing_duration: Histogram,
    pub db_operation_duration: HistogramVec,
    pub processing_latency: HistogramVec,
    pub http_request_duration: HistogramVec,
}

impl IngestMetrics {
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_processed = CounterVec::new(
            Opts::new(
                "messages_processed_total",
                "Total IoT messages processed by device and status.",
            )
            .namespace(NAMESPACE),
            &["device_id", "status"],
        )?;
        let kafka_messages_consumed = Counter::with_opts(
            Opts::new(
                "kafka_messages_consumed_total",
                "Total Kafka messages consumed.",
            )
            .namespace(NAMESPACE),
        )?;
        let kafka_messages_produced = Counter::with_opts(
            Opts::new(
                "kafka_messages_produced_total",
                "Total Kafka messages produced.",
            )
            .namespace(NAMESPACE),
        )?;
        let kafka_producer_errors = Counter::with_opts(
            Opts::new(
                "kafka_producer_errors_total",
                "Total Kafka producer errors.",
            )
            .namespace(NAMESPACE),
        )?;
        let db_transactions = Counter::with_opts(
            Opts::new("db_transactions_total", "Total storage transactions.").namespace(NAMESPACE),
        )?;
        let db_errors = Counter::with_opts(
            Opts::new("db_errors_total", "Total storage errors.").namespace(NAMESPACE),
        )?;
        let anomalies_detected = Counter::with_opts(
            Opts::new("anomalies_detected_total", "Total anomalies detected.").namespace(NAMESPACE),
        )?;
        let alerts_generated = Counter::with_opts(
            Opts::new("alerts_generated_total", "Total alerts generated.").namespace(NAMESPACE),
        )?;

        let batch_size = Gauge::with_opts(
            Opts::new("current_batch_size", "Size of the batch being processed.")
                .namespace(NAMESPACE),
        )?;
        let device_online_status = GaugeVec::new(
            Opts::new(
                "device_online_status",
                "Online status per device (1=online, 0=offline).",
            )
            .namespace(NAMESPACE),
            &["device_id", "device_type"],
        )?;
        let sensor_reading = GaugeVec::new(
            Opts::new("sensor_reading", "Most recent sensor value per device.")
                .namespace(NAMESPACE),
            &["device_id", "type"],
        )?;
        let tasks_alive = Gauge::with_opts(
            Opts::new("tasks_alive", "Number of live runtime tasks.").namespace(NAMESPACE),
        )?;
        let memory_alloc = Gauge::with_opts(
            Opts::new("memory_alloc_bytes", "Resident memory in bytes.").namespace(NAMESPACE),
        )?;
        let memory_heap = Gauge::with_opts(
            Opts::new("memory_heap_bytes", "Heap (data segment) memory in bytes.")
                .namespace(NAMESPACE),
        )?;
        let device_count = Gauge::with_opts(
            Opts::new("devices_total", "Number of known active devices.").namespace(NAMESPACE),
        )?;

        let batch_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_processing_duration_seconds",
                "Time taken to process a batch of messages.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        let db_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "db_operation_duration_seconds",
                "Duration of storage operations.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["operation"],
        )?;
        let processing_latency = HistogramVec::new(
            HistogramOpts::new(
                "message_processing_seconds",
                "Time taken to process messages by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["operation"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration by method and endpoint.",
            )
            .namespace(NAMESPACE),
            &["method", "endpoint"],
        )?;

        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(kafka_messages_consumed.clone()))?;
        registry.register(Box::new(kafka_messages_produced.clone()))?;
        registry.register(Box::new(kafka_producer_errors.clone()))?;
        registry.register(Box::new(db_transactions.clone()))?;
        registry.register(Box::new(db_errors.clone()))?;
        registry.register(Box::new(anomalies_detected.clone()))?;
        registry.register(Box::new(alerts_generated.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(device_online_status.clone()))?;
        registry.register(Box::new(sensor_reading.clone()))?;
        registry.register(Box::new(tasks_alive.clone()))?;
        registry.register(Box::new(memory_alloc.clone()))?;
        registry.register(Box::new(memory_heap.clone()))?;
        registry.register(Box::new(device_count.clone()))?;
        registry.register(Box::new(batch_processing_duration.clone()))?;
        registry.register(Box::new(db_operation_duration.clone()))?;
        registry.register(Box::new(processing_latency.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_processed,
            kafka_messages_consumed,
            kafka_messages_produced,
            kafka_producer_errors,
            db_transactions,
            db_errors,
            anomalies_detected,
            alerts_generated,
            batch_size,
            device_online_status,
            sensor_reading,
            tasks_alive,
            memory_alloc,
            memory_heap,
            device_count,
            batch_processing_duration,
            db_operation_duration,
            processing_latency,
            http_request_duration,
        })
    }

    /// Starts the scrape endpoint and the runtime sampler.
    pub async fn start(&self) -> Result<()> {
        // Accept the ":9091" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        self.spawn_sampler(cancel);
        Ok(())
    }

    /// Gracefully shuts down the scrape server and the sampler.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Periodically refreshes the runtime gauges.
    fn spawn_sampler(&self, cancel: CancellationToken) {
        let tasks_alive = self.tasks_alive.clone();
        let memory_alloc = self.memory_alloc.clone();
        let memory_heap = self.memory_heap.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let handle = tokio::runtime::Handle::current();
                        tasks_alive.set(handle.metrics().num_alive_tasks() as f64);

                        let (rss, heap) = process_memory();
                        memory_alloc.set(rss as f64);
                        memory_heap.set(heap as f64);
                    }
                }
            }
        });
    }
}

struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - simple liveness check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// `(resident, data segment)` bytes from /proc, zero where unavailable.
#[cfg(target_os = "linux")]
fn process_memory() -> (u64, u64) {
    let page_size = 4096u64;
    match std::fs::read_to_string("/proc/self/statm") {
        Ok(statm) => {
            let fields: Vec<u64> = statm
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            let rss = fields.get(1).copied().unwrap_or(0) * page_size;
            let data = fields.get(5).copied().unwrap_or(0) * page_size;
            (rss, data)
        }
        Err(_) => (0, 0),
    }
}

#[cfg(not(target_os = "linux"))]
fn process_memory() -> (u64, u64) {
    (0, 0)
}
