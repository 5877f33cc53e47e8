use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::DomainResult;
use crate::reading::{BenchmarkMetrics, GetReadingsInput, IotDevice, SensorReading, User};

/// Storage operations for the ingestion pipeline. Both backends satisfy this
/// contract; `batch_insert_readings` must be idempotent per
/// `(device_id, timestamp)`.
#[async_trait]
pub trait IotRepository: Send + Sync {
    /// Active devices, ordered by `device_id`.
    async fn get_devices(&self) -> DomainResult<Vec<IotDevice>>;

    /// Readings matching the AND-conjunction filter, newest first.
    async fn get_readings(&self, input: &GetReadingsInput) -> DomainResult<Vec<SensorReading>>;

    /// The most recent reading for each device.
    async fn get_latest_readings(&self) -> DomainResult<Vec<SensorReading>>;

    /// Persist a batch as a unit. Empty input is a no-op.
    async fn batch_insert_readings(&self, readings: &[SensorReading]) -> DomainResult<()>;

    async fn save_benchmark_metrics(&self, metrics: &BenchmarkMetrics) -> DomainResult<()>;

    /// Benchmark rows, newest first, limited when `limit > 0`.
    async fn get_benchmark_metrics(&self, limit: i64) -> DomainResult<Vec<BenchmarkMetrics>>;
}

/// User storage for the HTTP surface. Present on the relational backend only.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(&self, username: &str, password_hash: &str) -> DomainResult<User>;

    async fn get_user(&self, username: &str) -> DomainResult<Option<User>>;
}

/// Callback invoked with a transaction-scoped child registry. The child
/// lives no longer than the returned future.
pub type TxCallback =
    Box<dyn for<'r> FnOnce(&'r (dyn Registry + 'r)) -> BoxFuture<'r, DomainResult<()>> + Send>;

/// Backend-agnostic registry of repositories.
///
/// Immutable after construction except for `do_in_tx`, which yields a
/// derived child registry writing through an open transaction (relational)
/// or a batch scope (wide-column). Nesting `do_in_tx` is forbidden and
/// returns [`crate::DomainError::NestedTransaction`].
#[async_trait]
pub trait Registry: Send + Sync {
    fn iot(&self) -> &dyn IotRepository;

    /// `None` on backends without user storage.
    fn user(&self) -> Option<&dyn UserRepository>;

    /// Run `f` against a transactional child registry. Commits on `Ok`,
    /// rolls back (or discards the batch) on `Err`; either way no partial
    /// writes are observable outside the scope.
    async fn do_in_tx(&self, f: TxCallback) -> DomainResult<()>;
}
