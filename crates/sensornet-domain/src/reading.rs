use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// An IoT sensor device as registered in storage.
///
/// `device_id` is the stable external identity and the only key used on the
/// ingestion path; the surrogate `id` is storage-local.
#[derive(Debug, Clone, PartialEq)]
pub struct IotDevice {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub location: String,
    pub floor: i32,
    pub zone: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sensor device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Temperature,
    Humidity,
    Co2,
    Multi,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Temperature => "temperature",
            DeviceType::Humidity => "humidity",
            DeviceType::Co2 => "co2",
            DeviceType::Multi => "multi",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(DeviceType::Temperature),
            "humidity" => Ok(DeviceType::Humidity),
            "co2" => Ok(DeviceType::Co2),
            "multi" => Ok(DeviceType::Multi),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable timestamped observation, denormalized with the device
/// descriptors for query locality.
///
/// Within one device, `(device_id, timestamp)` is unique at millisecond
/// resolution on the wide-column backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub id: i64,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub location: String,
    pub floor: i32,
    pub zone: i32,
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
    /// Origin clock of the observation.
    pub timestamp: DateTime<Utc>,
    /// Ingest clock, stamped when the batch is decoded.
    pub created_at: DateTime<Utc>,
}

/// The broker wire format for a sensor reading, JSON-encoded.
///
/// All fields are required; unknown fields are ignored on decode and the
/// timestamp is RFC 3339.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDataMessage {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub location: String,
    pub floor: i32,
    pub zone: i32,
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorDataMessage {
    /// Promote the wire message into a reading, stamping the ingest clock.
    pub fn into_reading(self, created_at: DateTime<Utc>) -> SensorReading {
        SensorReading {
            id: 0,
            device_id: self.device_id,
            device_name: self.device_name,
            device_type: self.device_type,
            location: self.location,
            floor: self.floor,
            zone: self.zone,
            temperature: self.temperature,
            humidity: self.humidity,
            co2: self.co2,
            timestamp: self.timestamp,
            created_at,
        }
    }
}

/// AND-conjunction filter for querying readings. Empty strings, zero values
/// and `None` mean "not filtered".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetReadingsInput {
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub location: Option<String>,
    pub floor: i32,
    pub zone: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// One row per periodic benchmark flush.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkMetrics {
    pub total_records: i64,
    pub processed_records: i64,
    pub failed_records: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Average batch latency in milliseconds.
    pub average_latency: f64,
    /// Records per second since the aggregate started.
    pub throughput: f64,
    pub batch_size: i64,
    pub database_type: String,
}

impl BenchmarkMetrics {
    /// Validate the record before it is handed to a repository.
    pub fn validate(&self) -> DomainResult<()> {
        if self.total_records <= 0 || self.processed_records < 0 || self.failed_records < 0 {
            return Err(DomainError::InvalidBenchmarkMetrics(
                "record counts out of range".into(),
            ));
        }
        if self.end_time < self.start_time {
            return Err(DomainError::InvalidBenchmarkMetrics(
                "end time cannot be before start time".into(),
            ));
        }
        if self.average_latency < 0.0 || self.throughput < 0.0 || self.batch_size <= 0 {
            return Err(DomainError::InvalidBenchmarkMetrics(
                "invalid latency, throughput or batch size".into(),
            ));
        }
        Ok(())
    }
}

/// A user of the out-of-scope HTTP surface. Only the relational backend
/// stores users.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}
