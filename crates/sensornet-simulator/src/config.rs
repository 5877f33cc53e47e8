use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use sensornet_storage::StorageConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Kafka bootstrap address
    #[serde(default)]
    pub kafka_broker: String,

    /// Topic the synthetic readings are published to
    #[serde(default)]
    pub iot_topic: String,

    /// Messages per device worker per one-second tick
    #[serde(default = "default_producer_rate")]
    pub producer_rate: usize,

    /// Bound on the run duration in seconds
    #[serde(default = "default_simulator_run_secs")]
    pub simulator_run_secs: u64,

    /// Bind address of the metrics scrape endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    #[serde(skip)]
    pub storage: StorageConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_producer_rate() -> usize {
    100
}

fn default_simulator_run_secs() -> u64 {
    180
}

fn default_metrics_addr() -> String {
    ":9092".to_string()
}

impl SimulatorServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = Config::builder()
            .add_source(Environment::default())
            .build()?;

        let mut service: SimulatorServiceConfig = source.clone().try_deserialize()?;
        service.storage = source.try_deserialize()?;
        Ok(service)
    }

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
