use async_trait::async_trait;

use sensornet_domain::{
    DomainError, DomainResult, IotRepository, Registry, TxCallback, UserRepository,
};

use crate::iot_repo::CassIotRepository;
use crate::session::CassandraSession;

/// Wide-column registry. There is no user storage on this backend.
///
/// `do_in_tx` scopes the callback and forbids nesting; grouped writes are
/// unlogged batches built per repository call, so the scope itself carries
/// no cross-call accumulation.
pub struct CassandraRegistry {
    iot: CassIotRepository,
    in_batch: bool,
}

impl CassandraRegistry {
    pub fn new(session: CassandraSession) -> Self {
        Self {
            iot: CassIotRepository::new(session),
            in_batch: false,
        }
    }
}

#[async_trait]
impl Registry for CassandraRegistry {
    fn iot(&self) -> &dyn IotRepository {
        &self.iot
    }

    fn user(&self) -> Option<&dyn UserRepository> {
        None
    }

    async fn do_in_tx(&self, f: TxCallback) -> DomainResult<()> {
        if self.in_batch {
            return Err(DomainError::NestedTransaction);
        }

        let child = CassandraRegistry {
            iot: self.iot.clone(),
            in_batch: true,
        };
        f(&child).await
    }
}
