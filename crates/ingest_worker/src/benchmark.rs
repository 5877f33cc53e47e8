use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use sensornet_domain::BenchmarkMetrics;

/// Running aggregate behind the periodic benchmark flush. Writers are the
/// batch path, readers are snapshot reporters.
pub struct BenchmarkTracker {
    inner: RwLock<Aggregate>,
    batch_size: i64,
    database_type: String,
}

struct Aggregate {
    total_records: i64,
    processed_records: i64,
    failed_records: i64,
    start_time: DateTime<Utc>,
    last_processed: DateTime<Utc>,
    batch_count: i64,
    total_latency: Duration,
}

impl BenchmarkTracker {
    pub fn new(batch_size: usize, database_type: String) -> Self {
        let now = Utc::now();
        Self {
            inner: RwLock::new(Aggregate {
                total_records: 0,
                processed_records: 0,
                failed_records: 0,
                start_time: now,
                last_processed: now,
                batch_count: 0,
                total_latency: Duration::ZERO,
            }),
            batch_size: batch_size as i64,
            database_type,
        }
    }

    pub fn record_batch(&self, records: usize, latency: Duration) {
        let mut inner = self.inner.write();
        inner.total_records += records as i64;
        inner.processed_records += records as i64;
        inner.batch_count += 1;
        inner.total_latency += latency;
        inner.last_processed = Utc::now();
    }

    pub fn record_failed(&self, records: usize) {
        let mut inner = self.inner.write();
        inner.total_records += records as i64;
        inner.failed_records += records as i64;
    }

    pub fn snapshot(&self) -> BenchmarkMetrics {
        let inner = self.inner.read();

        let average_latency = if inner.batch_count > 0 {
            inner.total_latency.as_millis() as f64 / inner.batch_count as f64
        } else {
            0.0
        };

        let elapsed = (Utc::now() - inner.start_time).num_milliseconds() as f64 / 1_000.0;
        let throughput = if elapsed > 0.0 {
            inner.processed_records as f64 / elapsed
        } else {
            0.0
        };

        BenchmarkMetrics {
            total_records: inner.total_records,
            processed_records: inner.processed_records,
            failed_records: inner.failed_records,
            start_time: inner.start_time,
            end_time: inner.last_processed,
            average_latency,
            throughput,
            batch_size: self.batch_size,
            database_type: self.database_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_batches_and_failures() {
        let tracker = BenchmarkTracker::new(100, "PostgreSQL".to_string());
        tracker.record_batch(10, Duration::from_millis(20));
        tracker.record_batch(5, Duration::from_millis(40));
        tracker.record_failed(2);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_records, 17);
        assert_eq!(snapshot.processed_records, 15);
        assert_eq!(snapshot.failed_records, 2);
        assert_eq!(snapshot.batch_size, 100);
        assert_eq!(snapshot.database_type, "PostgreSQL");
        assert!((snapshot.average_latency - 30.0).abs() < 1e-9);
        assert!(snapshot.end_time >= snapshot.start_time);
    }

    #[test]
    fn empty_tracker_snapshot_is_zeroed() {
        let tracker = BenchmarkTracker::new(50, "Cassandra".to_string());
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_records, 0);
        assert_eq!(snapshot.average_latency, 0.0);
        // A zero-record snapshot fails validation and is never persisted.
        assert!(snapshot.validate().is_err());
    }
}
