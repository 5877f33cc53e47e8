pub mod batch_consumer;
pub mod message;
pub mod producer;
pub mod retry;
pub mod uid;

pub use batch_consumer::{BatchConsumer, BatchHandler, ConsumerConfig, DropHook};
pub use message::{ConsumerMessage, MessageId};
pub use producer::{ProducerMessageOptions, SyncProducer};
pub use retry::{retry, RetryError, RetryPolicy};
