use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use sensornet_storage::StorageConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Kafka bootstrap address
    #[serde(default)]
    pub kafka_broker: String,

    /// Topic carrying the sensor readings
    #[serde(default)]
    pub iot_topic: String,

    /// Consumer group name
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Batch flush threshold
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batch age trigger in seconds
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,

    /// Bind address of the metrics scrape endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// Minimum seconds between persisted benchmark records
    #[serde(default = "default_benchmark_flush_secs")]
    pub benchmark_flush_secs: u64,

    #[serde(skip)]
    pub storage: StorageConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_consumer_group() -> String {
    "iot".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> u64 {
    5
}

fn default_metrics_addr() -> String {
    ":9091".to_string()
}

fn default_benchmark_flush_secs() -> u64 {
    30
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = Config::builder()
            .add_source(Environment::default())
            .build()?;

        let mut service: ServiceConfig = source.clone().try_deserialize()?;
        service.storage = source.try_deserialize()?;
        Ok(service)
    }

    /// The broker address and topic have no usable defaults.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka_broker.is_empty() {
            return Err(ConfigError::Message("KAFKA_BROKER is not set".into()));
        }
        if self.iot_topic.is_empty() {
            return Err(ConfigError::Message("IOT_TOPIC is not set".into()));
        }
        Ok(())
    }
}
