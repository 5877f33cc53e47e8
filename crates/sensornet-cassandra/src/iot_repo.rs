use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::batch::{Batch, BatchType};
use scylla::frame::response::result::CqlValue;
use scylla::frame::value::{CqlTimestamp, CqlTimeuuid};
use scylla::query::Query;
use scylla::statement::Consistency;
use tracing::debug;

use sensornet_domain::{
    BenchmarkMetrics, DeviceType, DomainError, DomainResult, GetReadingsInput, IotDevice,
    IotRepository, SensorReading,
};

use crate::session::CassandraSession;
use crate::ts_deduper::TsDeduper;

const READING_COLUMNS: &str = "id, device_id, device_name, device_type, location, floor_id, \
                               zone_id, temperature, humidity, co2, timestamp, created_at";

type ReadingRow = (
    CqlTimeuuid,
    String,
    String,
    String,
    String,
    i32,
    i32,
    f64,
    f64,
    f64,
    DateTime<Utc>,
    DateTime<Utc>,
);

/// Cassandra implementation of the IoT repository. Inserts go through an
/// unlogged batch purely as a network-efficient grouped write.
#[derive(Clone)]
pub struct CassIotRepository {
    session: CassandraSession,
    deduper: Arc<TsDeduper>,
    node_id: [u8; 6],
}

impl CassIotRepository {
    pub fn new(session: CassandraSession) -> Self {
        Self {
            session,
            deduper: Arc::new(TsDeduper::new()),
            node_id: rand::random(),
        }
    }

    fn read_query(&self, stmt: impl Into<String>) -> Query {
        let mut query = Query::new(stmt);
        query.set_consistency(self.session.consistency());
        query
    }
}

#[async_trait]
impl IotRepository for CassIotRepository {
    async fn get_devices(&self) -> DomainResult<Vec<IotDevice>> {
        let query = self.read_query(
            "SELECT id, device_id, name, type, location, floor_id, zone_id, is_active, \
             created_at, updated_at FROM iot_devices WHERE is_active = true ALLOW FILTERING",
        );

        let result = self
            .session
            .session()
            .query_unpaged(query, ())
            .await
            .map_err(|e| DomainError::RepositoryError(anyhow!(e).context("querying devices")))?;

        type DeviceRow = (
            CqlTimeuuid,
            String,
            String,
            String,
            String,
            i32,
            i32,
            bool,
            DateTime<Utc>,
            DateTime<Utc>,
        );

        let rows = result
            .rows_typed::<DeviceRow>()
            .map_err(|e| DomainError::RepositoryError(anyhow!(e).context("reading device rows")))?;

        let mut devices = Vec::new();
        for row in rows {
            let (_, device_id, name, raw_type, location, floor, zone, is_active, created, updated) =
                row.map_err(|e| {
                    DomainError::RepositoryError(anyhow!(e).context("decoding device row"))
                })?;
            let device_type: DeviceType = raw_type
                .parse()
                .map_err(|e: String| DomainError::RepositoryError(anyhow!(e)))?;
            devices.push(IotDevice {
                id: 0,
                device_id,
                name,
                device_type,
                location,
                floor,
                zone,
                is_active,
                created_at: created,
                updated_at: updated,
            });
        }

        debug!(count = devices.len(), "loaded active devices");
        Ok(devices)
    }

    async fn get_readings(&self, input: &GetReadingsInput) -> DomainResult<Vec<SensorReading>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<CqlValue> = Vec::new();

        if let Some(device_id) = &input.device_id {
            conditions.push("device_id = ?");
            values.push(CqlValue::Text(device_id.clone()));
        }
        if let Some(start_time) = &input.start_time {
            conditions.push("timestamp >= ?");
            values.push(CqlValue::Timestamp(CqlTimestamp(
                start_time.timestamp_millis(),
            )));
        }
        if let Some(end_time) = &input.end_time {
            conditions.push("timestamp <= ?");
            values.push(CqlValue::Timestamp(CqlTimestamp(
                end_time.timestamp_millis(),
            )));
        }

        let mut stmt = format!("SELECT {READING_COLUMNS} FROM sensor_readings");
        if !conditions.is_empty() {
            stmt.push_str(" WHERE ");
            stmt.push_str(&conditions.join(" AND "));
        }
        if input.limit > 0 {
            stmt.push_str(&format!(" LIMIT {}", input.limit));
        }
        // Range scans without the partition key need server-side filtering.
        if input.device_id.is_none() && !conditions.is_empty() {
            stmt.push_str(" ALLOW FILTERING");
        }

        let result = self
            .session
            .session()
            .query_unpaged(self.read_query(stmt), values)
            .await
            .map_err(|e| DomainError::RepositoryError(anyhow!(e).context("querying readings")))?;

        collect_readings(result)
    }

    async fn get_latest_readings(&self) -> DomainResult<Vec<SensorReading>> {
        let device_result = self
            .session
            .session()
            .query_unpaged(self.read_query("SELECT device_id FROM iot_devices"), ())
            .await
            .map_err(|e| DomainError::RepositoryError(anyhow!(e).context("querying device ids")))?;

        let device_rows = device_result
            .rows_typed::<(String,)>()
            .map_err(|e| DomainError::RepositoryError(anyhow!(e).context("reading device ids")))?;

        let mut readings = Vec::new();
        for row in device_rows {
            let (device_id,) = row.map_err(|e| {
                DomainError::RepositoryError(anyhow!(e).context("decoding device id"))
            })?;

            let stmt = format!(
                "SELECT {READING_COLUMNS} FROM sensor_readings \
                 WHERE device_id = ? ORDER BY timestamp DESC LIMIT 1"
            );
            let result = self
                .session
                .session()
                .query_unpaged(self.read_query(stmt), (device_id.clone(),))
                .await
                .map_err(|e| {
                    DomainError::RepositoryError(
                        anyhow!(e).context(format!("querying latest reading for {device_id}")),
                    )
                })?;

            readings.extend(collect_readings(result)?);
        }

        Ok(readings)
    }

    async fn batch_insert_readings(&self, readings: &[SensorReading]) -> DomainResult<()> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new(BatchType::Unlogged);
        batch.set_consistency(Consistency::One);

        let stmt = "INSERT INTO sensor_readings \
                    (id, device_id, device_name, device_type, location, floor_id, zone_id, \
                     temperature, humidity, co2, timestamp, created_at, heat_index, \
                     air_quality_index, durable_write_ts) \
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

        let mut values = Vec::with_capacity(readings.len());
        for reading in readings {
            batch.append_statement(stmt);
            let ts = self.deduper.next(&reading.device_id, reading.timestamp);
            values.push((
                CqlTimeuuid::from(uuid::Uuid::now_v1(&self.node_id)),
                reading.device_id.clone(),
                reading.device_name.clone(),
                reading.device_type.clone(),
                reading.location.clone(),
                reading.floor,
                reading.zone,
                reading.temperature,
                reading.humidity,
                reading.co2,
                ts,
                Utc::now(),
                heat_index(reading.temperature, reading.humidity),
                air_quality_index(reading.co2),
                Utc::now(),
            ));
        }

        self.session
            .session()
            .batch(&batch, values)
            .await
            .map_err(|e| {
                DomainError::RepositoryError(anyhow!(e).context("batch inserting readings"))
            })?;

        debug!(rows = readings.len(), "unlogged batch executed");
        Ok(())
    }

    async fn save_benchmark_metrics(&self, metrics: &BenchmarkMetrics) -> DomainResult<()> {
        let stmt = "INSERT INTO benchmark_metrics \
                    (bucket, id, total_records, processed_records, failed_records, start_time, \
                     end_time, average_latency, throughput, batch_size, database_type, created_at) \
                    VALUES ('global', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

        self.session
            .session()
            .query_unpaged(
                self.read_query(stmt),
                (
                    CqlTimeuuid::from(uuid::Uuid::now_v1(&self.node_id)),
                    metrics.total_records,
                    metrics.processed_records,
                    metrics.failed_records,
                    metrics.start_time,
                    metrics.end_time,
                    metrics.average_latency,
                    metrics.throughput,
                    metrics.batch_size,
                    metrics.database_type.clone(),
                    Utc::now(),
                ),
            )
            .await
            .map_err(|e| {
                DomainError::RepositoryError(anyhow!(e).context("saving benchmark metrics"))
            })?;

        Ok(())
    }

    async fn get_benchmark_metrics(&self, limit: i64) -> DomainResult<Vec<BenchmarkMetrics>> {
        let mut stmt = String::from(
            "SELECT total_records, processed_records, failed_records, start_time, end_time, \
             average_latency, throughput, batch_size, database_type \
             FROM benchmark_metrics WHERE bucket = 'global' ORDER BY created_at DESC",
        );
        if limit > 0 {
            stmt.push_str(&format!(" LIMIT {limit}"));
        }

        let result = self
            .session
            .session()
            .query_unpaged(self.read_query(stmt), ())
            .await
            .map_err(|e| {
                DomainError::RepositoryError(anyhow!(e).context("querying benchmark metrics"))
            })?;

        type MetricsRow = (
            i64,
            i64,
            i64,
            DateTime<Utc>,
            DateTime<Utc>,
            f64,
            f64,
            i64,
            String,
        );

        let rows = result.rows_typed::<MetricsRow>().map_err(|e| {
            DomainError::RepositoryError(anyhow!(e).context("reading benchmark rows"))
        })?;

        let mut metrics = Vec::new();
        for row in rows {
            let (total, processed, failed, start, end, latency, throughput, batch_size, db_type) =
                row.map_err(|e| {
                    DomainError::RepositoryError(anyhow!(e).context("decoding benchmark row"))
                })?;
            metrics.push(BenchmarkMetrics {
                total_records: total,
                processed_records: processed,
                failed_records: failed,
                start_time: start,
                end_time: end,
                average_latency: latency,
                throughput,
                batch_size,
                database_type: db_type,
            });
        }

        Ok(metrics)
    }
}

fn collect_readings(result: scylla::QueryResult) -> DomainResult<Vec<SensorReading>> {
    let rows = result
        .rows_typed::<ReadingRow>()
        .map_err(|e| DomainError::RepositoryError(anyhow!(e).context("reading rows")))?;

    let mut readings = Vec::new();
    for row in rows {
        let (
            _,
            device_id,
            device_name,
            device_type,
            location,
            floor,
            zone,
            temperature,
            humidity,
            co2,
            timestamp,
            created_at,
        ) = row
            .map_err(|e| DomainError::RepositoryError(anyhow!(e).context("decoding reading row")))?;
        readings.push(SensorReading {
            id: 0,
            device_id,
            device_name,
            device_type,
            location,
            floor,
            zone,
            temperature,
            humidity,
            co2,
            timestamp,
            created_at,
        });
    }
    Ok(readings)
}

/// Perceived temperature from temperature and relative humidity.
pub(crate) fn heat_index(temperature: f64, humidity: f64) -> f64 {
    0.5 * (temperature + 61.0 + ((temperature - 68.0) * 1.2) + (humidity * 0.094))
}

/// Four-bucket air quality tag from CO2 ppm.
pub(crate) fn air_quality_index(co2: f64) -> i32 {
    match co2 {
        c if c >= 5000.0 => 4,
        c if c >= 2000.0 => 3,
        c if c >= 1000.0 => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heat_index_formula() {
        let hi = heat_index(68.0, 0.0);
        // At 68F with no humidity contribution the formula collapses.
        assert!((hi - 64.5).abs() < 1e-9);

        let with_humidity = heat_index(68.0, 50.0);
        assert!((with_humidity - (64.5 + 0.5 * 50.0 * 0.094)).abs() < 1e-9);
    }

    #[test]
    fn air_quality_buckets() {
        assert_eq!(air_quality_index(400.0), 1);
        assert_eq!(air_quality_index(999.9), 1);
        assert_eq!(air_quality_index(1000.0), 2);
        assert_eq!(air_quality_index(1999.9), 2);
        assert_eq!(air_quality_index(2000.0), 3);
        assert_eq!(air_quality_index(4999.9), 3);
        assert_eq!(air_quality_index(5000.0), 4);
    }
}
