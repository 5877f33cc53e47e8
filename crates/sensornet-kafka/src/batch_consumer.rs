use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::ConsumerMessage;
use crate::retry::{retry, RetryError, RetryPolicy};

/// Processes one batch of messages from a single partition. The whole batch
/// must persist as a unit for the call to succeed.
pub type BatchHandler =
    Arc<dyn Fn(Vec<ConsumerMessage>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Invoked for every poison record the consumer drops.
pub type DropHook = Arc<dyn Fn(&ConsumerMessage) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub broker: String,
    pub topic: String,
    pub group_id: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub retry: RetryPolicy,
    pub run_id: String,
}

/// Logs partition assignment changes and commit outcomes.
struct ClaimContext;

impl ClientContext for ClaimContext {}

impl ConsumerContext for ClaimContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "rebalance starting");
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "rebalance complete");
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(?offsets, "offsets committed"),
            Err(e) => error!(error = %e, "offset commit failed"),
        }
    }
}

type LoggingConsumer = StreamConsumer<ClaimContext>;

/// Acknowledges progress to the broker. Split out so claim workers can be
/// exercised without a live cluster.
#[cfg_attr(test, mockall::automock)]
trait OffsetCommitter: Send + Sync {
    /// Mark everything up to and including `offset` as handled and flush the
    /// commit to the broker.
    fn commit_through(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

struct KafkaCommitter {
    consumer: Arc<LoggingConsumer>,
}

impl OffsetCommitter for KafkaCommitter {
    fn commit_through(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .with_context(|| format!("marking offset {}[{}]@{}", topic, partition, offset + 1))?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .context("committing offsets")
    }
}

/// Kafka consumer that groups records per partition claim and persists them
/// in batches with at-least-once semantics.
///
/// Offsets advance only for records that were durably handled or explicitly
/// dropped as poison; everything else is redelivered.
pub struct BatchConsumer {
    consumer: Arc<LoggingConsumer>,
    config: ConsumerConfig,
    handler: BatchHandler,
    on_drop: Option<DropHook>,
}

impl BatchConsumer {
    pub fn new(config: ConsumerConfig, handler: BatchHandler) -> Result<Self> {
        if config.topic.is_empty() {
            bail!("topic is empty");
        }

        info!(
            broker = %config.broker,
            topic = %config.topic,
            group = %config.group_id,
            batch_size = config.batch_size,
            "initializing kafka batch consumer"
        );

        let consumer: LoggingConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.broker)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create_with_context(ClaimContext)
            .context("creating kafka consumer")?;

        Ok(Self {
            consumer: Arc::new(consumer),
            config,
            handler,
            on_drop: None,
        })
    }

    /// Register a hook observing dropped poison records.
    pub fn with_drop_hook(mut self, hook: DropHook) -> Self {
        self.on_drop = Some(hook);
        self
    }

    /// Consume until `token` is cancelled. Each assigned partition gets its
    /// own claim task owning its batch buffer; this loop only routes.
    ///
    /// Returns `Ok(())` after a drained graceful shutdown and the first
    /// fatal client error otherwise.
    pub async fn consume(&self, token: CancellationToken) -> Result<()> {
        self.consumer
            .subscribe(&[self.config.topic.as_str()])
            .context("subscribing to topic")?;

        let mut claims: HashMap<i32, mpsc::Sender<ConsumerMessage>> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut fatal: Option<anyhow::Error> = None;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("shutdown requested, draining partition claims");
                    break;
                }
                polled = self.consumer.recv() => match polled {
                    Ok(borrowed) => {
                        let msg = ConsumerMessage::from_borrowed(&borrowed);
                        let partition = msg.id.partition;
                        let sender = claims.entry(partition).or_insert_with(|| {
                            self.spawn_claim(partition, &mut workers, &token)
                        });
                        if sender.send(msg).await.is_err() {
                            warn!(partition, "claim task gone, message will be redelivered");
                        }
                    }
                    Err(KafkaError::PartitionEOF(partition)) => {
                        debug!(partition, "partition EOF");
                    }
                    Err(e) => {
                        error!(error = %e, "consuming failed");
                        fatal = Some(anyhow::Error::new(e).context("consuming failed"));
                        break;
                    }
                }
            }
        }

        // Closing the channels ends every claim with a final flush.
        drop(claims);
        while workers.join_next().await.is_some() {}

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release group membership and the underlying client.
    pub fn close(&self) {
        self.consumer.unsubscribe();
        info!("kafka consumer closed");
    }

    fn spawn_claim(
        &self,
        partition: i32,
        workers: &mut JoinSet<()>,
        token: &CancellationToken,
    ) -> mpsc::Sender<ConsumerMessage> {
        let (tx, rx) = mpsc::channel(self.config.batch_size.max(1) * 2);
        let worker = ClaimWorker {
            run_id: self.config.run_id.clone(),
            topic: self.config.topic.clone(),
            partition,
            batch_size: self.config.batch_size,
            batch_timeout: self.config.batch_timeout,
            retry_policy: self.config.retry.clone(),
            handler: Arc::clone(&self.handler),
            on_drop: self.on_drop.clone(),
            committer: Arc::new(KafkaCommitter {
                consumer: Arc::clone(&self.consumer),
            }),
            token: token.clone(),
        };
        info!(partition, "partition claim started");
        workers.spawn(worker.run(rx));
        tx
    }
}

/// One claim task: owns the batch buffer for a single partition and flushes
/// it on size, age, claim end, or cancellation.
struct ClaimWorker {
    run_id: String,
    topic: String,
    partition: i32,
    batch_size: usize,
    batch_timeout: Duration,
    retry_policy: RetryPolicy,
    handler: BatchHandler,
    on_drop: Option<DropHook>,
    committer: Arc<dyn OffsetCommitter>,
    token: CancellationToken,
}

impl ClaimWorker {
    async fn run(self, mut rx: mpsc::Receiver<ConsumerMessage>) {
        let mut buffer: Vec<ConsumerMessage> = Vec::with_capacity(self.batch_size);
        let timer = tokio::time::sleep(self.batch_timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(msg) => {
                        buffer.push(msg);
                        if buffer.len() >= self.batch_size {
                            self.process_and_commit(&mut buffer).await;
                            timer.as_mut().reset(Instant::now() + self.batch_timeout);
                        }
                    }
                    None => {
                        self.process_and_commit(&mut buffer).await;
                        break;
                    }
                },
                () = &mut timer => {
                    // An empty buffer re-arms without flushing.
                    self.process_and_commit(&mut buffer).await;
                    timer.as_mut().reset(Instant::now() + self.batch_timeout);
                }
                () = self.token.cancelled() => {
                    self.process_and_commit(&mut buffer).await;
                    break;
                }
            }
        }

        debug!(partition = self.partition, "partition claim finished");
    }

    /// Drain the buffer: whole-batch retry bounded by the batch timeout,
    /// bisection fallback, then one commit covering successes and drops.
    async fn process_and_commit(&self, buffer: &mut Vec<ConsumerMessage>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        let offset_first = batch[0].id.offset;
        let offset_last = batch[batch.len() - 1].id.offset;
        let started = Instant::now();

        let whole_batch = tokio::time::timeout(
            self.batch_timeout,
            retry(&self.retry_policy, &self.token, || {
                let attempt = self.attempt(batch.clone());
                async move { attempt.await.map_err(RetryError::Transient) }
            }),
        )
        .await;

        match whole_batch {
            Ok(Ok(())) => {
                info!(
                    run_id = %self.run_id,
                    partition = self.partition,
                    offset_first,
                    offset_last,
                    batch_size = batch.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "batch processed"
                );
                self.commit(offset_last);
            }
            _ if self.token.is_cancelled() => {
                debug!(
                    partition = self.partition,
                    offset_first,
                    offset_last,
                    "abandoning in-flight batch on cancellation"
                );
            }
            Ok(Err(err)) => {
                warn!(
                    run_id = %self.run_id,
                    partition = self.partition,
                    offset_first,
                    offset_last,
                    error = %err,
                    "batch retry exhausted, isolating poison records"
                );
                self.bisect_and_commit(batch).await;
            }
            Err(_) => {
                warn!(
                    run_id = %self.run_id,
                    partition = self.partition,
                    offset_first,
                    offset_last,
                    timeout_ms = self.batch_timeout.as_millis() as u64,
                    "batch deadline exceeded, isolating poison records"
                );
                self.bisect_and_commit(batch).await;
            }
        }
    }

    async fn bisect_and_commit(&self, batch: Vec<ConsumerMessage>) {
        let mut succeeded = Vec::new();
        let mut dropped = Vec::new();
        self.bisect(batch, &mut succeeded, &mut dropped).await;

        for poison in &dropped {
            warn!(
                run_id = %self.run_id,
                topic = %poison.id.topic,
                partition = poison.id.partition,
                offset = poison.id.offset,
                key = %poison.id.key,
                "dropping poison message"
            );
            if let Some(hook) = &self.on_drop {
                hook(poison);
            }
        }

        // Successes are durable and drops must not stall the partition; both
        // advance the offset. Bisection resolves the batch front to back, so
        // the resolved set is an offset-contiguous prefix even when
        // cancellation abandons the rest.
        let resolved_through = succeeded
            .iter()
            .chain(dropped.iter())
            .map(|m| m.id.offset)
            .max();
        if let Some(offset) = resolved_through {
            self.commit(offset);
        }
    }

    /// Divide and conquer: one attempt per sub-batch, splitting at the
    /// midpoint on failure; a failing singleton is poison.
    fn bisect<'a>(
        &'a self,
        mut batch: Vec<ConsumerMessage>,
        succeeded: &'a mut Vec<ConsumerMessage>,
        dropped: &'a mut Vec<ConsumerMessage>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if batch.is_empty() || self.token.is_cancelled() {
                return;
            }
            match self.attempt(batch.clone()).await {
                Ok(()) => succeeded.append(&mut batch),
                Err(_) if batch.len() == 1 => dropped.append(&mut batch),
                Err(_) => {
                    let right = batch.split_off(batch.len() / 2);
                    self.bisect(batch, succeeded, dropped).await;
                    self.bisect(right, succeeded, dropped).await;
                }
            }
        })
    }

    /// One handler invocation; a panic counts as a failed attempt.
    fn attempt(&self, batch: Vec<ConsumerMessage>) -> BoxFuture<'static, Result<()>> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            match AssertUnwindSafe(handler(batch)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(&panic))),
            }
        })
    }

    fn commit(&self, offset: i64) {
        if let Err(err) = self
            .committer
            .commit_through(&self.topic, self.partition, offset)
        {
            error!(
                partition = self.partition,
                offset,
                error = %err,
                "failed to commit offsets"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::message::test_message;

    struct Harness {
        tx: mpsc::Sender<ConsumerMessage>,
        token: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(10),
            multiplier: 1.25,
            max_interval: Duration::from_millis(50),
            max_elapsed: Duration::from_secs(60),
            max_retries: 2,
            jitter: 0.0,
        }
    }

    fn spawn_worker(
        batch_size: usize,
        batch_timeout: Duration,
        retry_policy: RetryPolicy,
        handler: BatchHandler,
        committer: Arc<dyn OffsetCommitter>,
        on_drop: Option<DropHook>,
    ) -> Harness {
        let token = CancellationToken::new();
        let worker = ClaimWorker {
            run_id: "test-run".to_string(),
            topic: "iot-readings".to_string(),
            partition: 0,
            batch_size,
            batch_timeout,
            retry_policy,
            handler,
            on_drop,
            committer,
            token: token.clone(),
        };
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(worker.run(rx));
        Harness { tx, token, task }
    }

    fn recording_handler(batches: Arc<Mutex<Vec<usize>>>) -> BatchHandler {
        Arc::new(move |batch| {
            let batches = Arc::clone(&batches);
            Box::pin(async move {
                batches.lock().unwrap().push(batch.len());
                Ok(())
            })
        })
    }

    fn poison_handler(batches: Arc<Mutex<Vec<usize>>>) -> BatchHandler {
        Arc::new(move |batch: Vec<ConsumerMessage>| {
            let batches = Arc::clone(&batches);
            Box::pin(async move {
                if batch.iter().any(|m| m.value == b"poison") {
                    bail!("constraint violation");
                }
                batches.lock().unwrap().push(batch.len());
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_full_batch() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let mut committer = MockOffsetCommitter::new();
        committer
            .expect_commit_through()
            .withf(|topic, partition, offset| {
                topic == "iot-readings" && *partition == 0 && *offset == 9
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = spawn_worker(
            10,
            Duration::from_secs(5),
            fast_retry(),
            recording_handler(Arc::clone(&batches)),
            Arc::new(committer),
            None,
        );

        for offset in 0..10 {
            harness
                .tx
                .send(test_message(0, offset, b"{}"))
                .await
                .unwrap();
        }
        drop(harness.tx);
        harness.task.await.unwrap();

        assert_eq!(*batches.lock().unwrap(), vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_trigger_flushes_partial_batch() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let mut committer = MockOffsetCommitter::new();
        committer
            .expect_commit_through()
            .times(2)
            .returning(|_, _, _| Ok(()));

        let harness = spawn_worker(
            100,
            Duration::from_secs(5),
            fast_retry(),
            recording_handler(Arc::clone(&batches)),
            Arc::new(committer),
            None,
        );

        // Size trigger first: a hundred messages well within the timeout.
        for offset in 0..100 {
            harness
                .tx
                .send(test_message(0, offset, b"{}"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*batches.lock().unwrap(), vec![100]);

        // Then the age trigger picks up a partial batch.
        for offset in 100..103 {
            harness
                .tx
                .send(test_message(0, offset, b"{}"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*batches.lock().unwrap(), vec![100, 3]);

        drop(harness.tx);
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_timer_fire_does_not_flush() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let committer = MockOffsetCommitter::new();

        let harness = spawn_worker(
            10,
            Duration::from_millis(100),
            fast_retry(),
            recording_handler(Arc::clone(&batches)),
            Arc::new(committer),
            None,
        );

        // Several timer periods with nothing buffered.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(batches.lock().unwrap().is_empty());

        harness.token.cancel();
        harness.task.await.unwrap();
        assert!(batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poison_record_is_isolated_and_all_offsets_commit() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(Mutex::new(Vec::new()));
        let drop_log = Arc::clone(&drops);

        let mut committer = MockOffsetCommitter::new();
        committer
            .expect_commit_through()
            .withf(|_, _, offset| *offset == 3)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = spawn_worker(
            4,
            Duration::from_millis(200),
            fast_retry(),
            poison_handler(Arc::clone(&batches)),
            Arc::new(committer),
            Some(Arc::new(move |msg: &ConsumerMessage| {
                drop_log.lock().unwrap().push(msg.id.offset);
            })),
        );

        harness.tx.send(test_message(0, 0, b"{}")).await.unwrap();
        harness.tx.send(test_message(0, 1, b"{}")).await.unwrap();
        harness
            .tx
            .send(test_message(0, 2, b"poison"))
            .await
            .unwrap();
        harness.tx.send(test_message(0, 3, b"{}")).await.unwrap();

        drop(harness.tx);
        harness.task.await.unwrap();

        // {#1,#2} and {#4} persisted, #3 dropped.
        assert_eq!(*batches.lock().unwrap(), vec![2, 1]);
        assert_eq!(*drops.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_of_one_reduces_to_immediate_drop() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(AtomicUsize::new(0));
        let drop_count = Arc::clone(&drops);

        let mut committer = MockOffsetCommitter::new();
        committer
            .expect_commit_through()
            .withf(|_, _, offset| *offset == 0)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = spawn_worker(
            1,
            Duration::from_millis(100),
            fast_retry(),
            poison_handler(Arc::clone(&batches)),
            Arc::new(committer),
            Some(Arc::new(move |_: &ConsumerMessage| {
                drop_count.fetch_add(1, Ordering::SeqCst);
            })),
        );

        harness
            .tx
            .send(test_message(0, 0, b"poison"))
            .await
            .unwrap();
        drop(harness.tx);
        harness.task.await.unwrap();

        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_flushes_pending_buffer() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let mut committer = MockOffsetCommitter::new();
        committer
            .expect_commit_through()
            .withf(|_, _, offset| *offset == 1)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = spawn_worker(
            10,
            Duration::from_secs(5),
            fast_retry(),
            recording_handler(Arc::clone(&batches)),
            Arc::new(committer),
            None,
        );

        harness.tx.send(test_message(0, 0, b"{}")).await.unwrap();
        harness.tx.send(test_message(0, 1, b"{}")).await.unwrap();
        tokio::task::yield_now().await;

        harness.token.cancel();
        harness.task.await.unwrap();

        assert_eq!(*batches.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_is_contained_and_poison_dropped() {
        let panicking: BatchHandler = Arc::new(|batch: Vec<ConsumerMessage>| {
            Box::pin(async move {
                if batch.iter().any(|m| m.value == b"boom") {
                    panic!("decoder exploded");
                }
                Ok(())
            })
        });

        let mut committer = MockOffsetCommitter::new();
        committer
            .expect_commit_through()
            .withf(|_, _, offset| *offset == 1)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = spawn_worker(
            2,
            Duration::from_millis(100),
            fast_retry(),
            panicking,
            Arc::new(committer),
            None,
        );

        harness.tx.send(test_message(0, 0, b"{}")).await.unwrap();
        harness.tx.send(test_message(0, 1, b"boom")).await.unwrap();
        drop(harness.tx);
        harness.task.await.unwrap();
    }
}
