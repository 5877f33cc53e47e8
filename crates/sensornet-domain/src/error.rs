use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("transaction nested in transaction")]
    NestedTransaction,

    #[error("invalid benchmark metrics: {0}")]
    InvalidBenchmarkMetrics(String),

    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("user already exists: {0}")]
    UserAlreadyExists(String),

    #[error("repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
