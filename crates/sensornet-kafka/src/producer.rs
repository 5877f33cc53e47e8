use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info};

use crate::uid;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for a single produced message. A missing key is replaced with a
/// generated unique id.
#[derive(Debug, Clone, Default)]
pub struct ProducerMessageOptions {
    pub key: Option<String>,
    pub partition: Option<i32>,
    pub headers: HashMap<String, String>,
}

/// Kafka producer that confirms delivery of every message before returning.
pub struct SyncProducer {
    producer: FutureProducer,
}

impl SyncProducer {
    pub fn new(broker: &str) -> Result<Self> {
        info!(broker, "initializing kafka producer");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .set("acks", "all")
            .set("message.timeout.ms", "10000")
            .create()
            .context("creating kafka producer")?;

        Ok(Self { producer })
    }

    /// Send one message and wait for the broker acknowledgment. Returns the
    /// `(partition, offset)` the record landed on.
    pub async fn send_message(
        &self,
        topic: &str,
        payload: &[u8],
        opts: ProducerMessageOptions,
    ) -> Result<(i32, i64)> {
        if topic.is_empty() {
            bail!("topic is empty");
        }
        if payload.is_empty() {
            bail!("no payload provided");
        }

        let key = opts.key.unwrap_or_else(uid::generate);

        let mut record = FutureRecord::to(topic).payload(payload).key(&key);
        if let Some(partition) = opts.partition {
            record = record.partition(partition);
        }
        if !opts.headers.is_empty() {
            let mut headers = OwnedHeaders::new();
            for (name, value) in &opts.headers {
                headers = headers.insert(Header {
                    key: name,
                    value: Some(value.as_bytes()),
                });
            }
            record = record.headers(headers);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(err, _)| anyhow::Error::new(err).context("sending message"))?;

        debug!(topic, partition, offset, "message delivered");
        Ok((partition, offset))
    }

    /// Flush in-flight deliveries before shutdown.
    pub fn close(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(SEND_TIMEOUT))
            .context("flushing producer")
    }
}
