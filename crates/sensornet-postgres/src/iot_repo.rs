use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::debug;

use sensornet_domain::{
    BenchmarkMetrics, DeviceType, DomainError, DomainResult, GetReadingsInput, IotDevice,
    IotRepository, SensorReading,
};

use crate::client::PostgresClient;

/// The backend caps bound variables; at 11 parameters per row this keeps a
/// statement comfortably under the limit.
const MAX_ROWS_PER_INSERT: usize = 5_000;

const READING_COLUMNS: &str = "id, device_id, device_name, device_type, location, floor_id, \
                               zone_id, temperature, humidity, co2, timestamp, created_at";

/// Executes statements either through the pool or through one open
/// transaction, so the same repository serves both registry scopes.
pub(crate) enum PgExecutor<'a> {
    Pool(PostgresClient),
    Tx(&'a tokio_postgres::Transaction<'a>),
}

impl PgExecutor<'_> {
    pub(crate) async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        match self {
            PgExecutor::Pool(client) => {
                let conn = client.get_connection().await?;
                Ok(conn.execute(sql, params).await?)
            }
            PgExecutor::Tx(tx) => Ok(tx.execute(sql, params).await?),
        }
    }

    pub(crate) async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        match self {
            PgExecutor::Pool(client) => {
                let conn = client.get_connection().await?;
                Ok(conn.query(sql, params).await?)
            }
            PgExecutor::Tx(tx) => Ok(tx.query(sql, params).await?),
        }
    }

    pub(crate) async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        match self {
            PgExecutor::Pool(client) => {
                let conn = client.get_connection().await?;
                Ok(conn.query_opt(sql, params).await?)
            }
            PgExecutor::Tx(tx) => Ok(tx.query_opt(sql, params).await?),
        }
    }
}

/// PostgreSQL implementation of the IoT repository.
pub struct PgIotRepository<'a> {
    conn: PgExecutor<'a>,
}

impl<'a> PgIotRepository<'a> {
    pub(crate) fn new(conn: PgExecutor<'a>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl IotRepository for PgIotRepository<'_> {
    async fn get_devices(&self) -> DomainResult<Vec<IotDevice>> {
        let rows = self
            .conn
            .query(
                "SELECT id, device_id, name, type, location, floor_id, zone_id, is_active, \
                 created_at, updated_at \
                 FROM iot_devices WHERE is_active = true ORDER BY device_id",
                &[],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.context("querying devices")))?;

        let mut devices = Vec::with_capacity(rows.len());
        for row in rows {
            devices.push(device_from_row(&row)?);
        }

        debug!(count = devices.len(), "loaded active devices");
        Ok(devices)
    }

    async fn get_readings(&self, input: &GetReadingsInput) -> DomainResult<Vec<SensorReading>> {
        let (sql, params) = build_readings_query(input);
        let rows = self
            .conn
            .query(&sql, &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.context("querying readings")))?;

        Ok(rows.iter().map(reading_from_row).collect())
    }

    async fn get_latest_readings(&self) -> DomainResult<Vec<SensorReading>> {
        let sql = format!(
            "SELECT DISTINCT ON (device_id) {READING_COLUMNS} \
             FROM sensor_readings ORDER BY device_id, timestamp DESC"
        );
        let rows = self
            .conn
            .query(&sql, &[])
            .await
            .map_err(|e| DomainError::RepositoryError(e.context("querying latest readings")))?;

        Ok(rows.iter().map(reading_from_row).collect())
    }

    async fn batch_insert_readings(&self, readings: &[SensorReading]) -> DomainResult<()> {
        if readings.is_empty() {
            return Ok(());
        }

        for chunk in readings.chunks(MAX_ROWS_PER_INSERT) {
            let sql = build_insert_sql(chunk.len());
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 11);
            for reading in chunk {
                params.push(&reading.device_id);
                params.push(&reading.device_name);
                params.push(&reading.device_type);
                params.push(&reading.location);
                params.push(&reading.floor);
                params.push(&reading.zone);
                params.push(&reading.temperature);
                params.push(&reading.humidity);
                params.push(&reading.co2);
                params.push(&reading.timestamp);
                params.push(&reading.created_at);
            }

            self.conn
                .execute(&sql, &params)
                .await
                .map_err(|e| DomainError::RepositoryError(e.context("batch inserting readings")))?;
        }

        Ok(())
    }

    async fn save_benchmark_metrics(&self, metrics: &BenchmarkMetrics) -> DomainResult<()> {
        self.conn
            .execute(
                "INSERT INTO benchmark_metrics \
                 (total_records, processed_records, failed_records, start_time, end_time, \
                  average_latency, throughput, batch_size, database_type, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &metrics.total_records,
                    &metrics.processed_records,
                    &metrics.failed_records,
                    &metrics.start_time,
                    &metrics.end_time,
                    &metrics.average_latency,
                    &metrics.throughput,
                    &metrics.batch_size,
                    &metrics.database_type,
                    &Utc::now(),
                ],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.context("saving benchmark metrics")))?;

        Ok(())
    }

    async fn get_benchmark_metrics(&self, limit: i64) -> DomainResult<Vec<BenchmarkMetrics>> {
        let mut sql = String::from(
            "SELECT total_records, processed_records, failed_records, start_time, end_time, \
             average_latency, throughput, batch_size, database_type \
             FROM benchmark_metrics ORDER BY created_at DESC",
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if limit > 0 {
            params.push(&limit);
            sql.push_str(" LIMIT $1");
        }

        let rows = self
            .conn
            .query(&sql, &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.context("querying benchmark metrics")))?;

        Ok(rows
            .iter()
            .map(|row| BenchmarkMetrics {
                total_records: row.get(0),
                processed_records: row.get(1),
                failed_records: row.get(2),
                start_time: row.get(3),
                end_time: row.get(4),
                average_latency: row.get(5),
                throughput: row.get(6),
                batch_size: row.get(7),
                database_type: row.get(8),
            })
            .collect())
    }
}

fn device_from_row(row: &Row) -> DomainResult<IotDevice> {
    let raw_type: String = row.get(3);
    let device_type: DeviceType = raw_type
        .parse()
        .map_err(|e: String| DomainError::RepositoryError(anyhow!(e)))?;

    Ok(IotDevice {
        id: row.get(0),
        device_id: row.get(1),
        name: row.get(2),
        device_type,
        location: row.get(4),
        floor: row.get(5),
        zone: row.get(6),
        is_active: row.get(7),
        created_at: row.get(8),
        updated_at: row.get(9),
    })
}

fn reading_from_row(row: &Row) -> SensorReading {
    SensorReading {
        id: row.get(0),
        device_id: row.get(1),
        device_name: row.get(2),
        device_type: row.get(3),
        location: row.get(4),
        floor: row.get(5),
        zone: row.get(6),
        temperature: row.get(7),
        humidity: row.get(8),
        co2: row.get(9),
        timestamp: row.get(10),
        created_at: row.get(11),
    }
}

/// Multi-row upsert; conflicting `(device_id, timestamp)` rows resolve to
/// the incoming values.
fn build_insert_sql(rows: usize) -> String {
    let mut sql = String::from(
        "INSERT INTO sensor_readings \
         (device_id, device_name, device_type, location, floor_id, zone_id, \
          temperature, humidity, co2, timestamp, created_at) VALUES ",
    );

    for row in 0..rows {
        if row > 0 {
            sql.push(',');
        }
        let base = row * 11;
        sql.push('(');
        for col in 1..=11 {
            if col > 1 {
                sql.push(',');
            }
            sql.push_str(&format!("${}", base + col));
        }
        sql.push(')');
    }

    sql.push_str(
        " ON CONFLICT (device_id, timestamp) DO UPDATE SET \
         temperature = EXCLUDED.temperature, \
         humidity = EXCLUDED.humidity, \
         co2 = EXCLUDED.co2",
    );
    sql
}

fn build_readings_query(input: &GetReadingsInput) -> (String, Vec<&(dyn ToSql + Sync)>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

    if let Some(device_id) = &input.device_id {
        params.push(device_id);
        conditions.push(format!("device_id = ${}", params.len()));
    }
    if let Some(device_type) = &input.device_type {
        params.push(device_type);
        conditions.push(format!("device_type = ${}", params.len()));
    }
    if let Some(location) = &input.location {
        params.push(location);
        conditions.push(format!("location = ${}", params.len()));
    }
    if input.floor > 0 {
        params.push(&input.floor);
        conditions.push(format!("floor_id = ${}", params.len()));
    }
    if input.zone > 0 {
        params.push(&input.zone);
        conditions.push(format!("zone_id = ${}", params.len()));
    }
    if let Some(start_time) = &input.start_time {
        params.push(start_time);
        conditions.push(format!("timestamp >= ${}", params.len()));
    }
    if let Some(end_time) = &input.end_time {
        params.push(end_time);
        conditions.push(format!("timestamp <= ${}", params.len()));
    }

    let mut sql = format!("SELECT {READING_COLUMNS} FROM sensor_readings");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY timestamp DESC");
    if input.limit > 0 {
        params.push(&input.limit);
        sql.push_str(&format!(" LIMIT ${}", params.len()));
    }

    (sql, params)
}
