use async_trait::async_trait;
use tracing::debug;

use sensornet_domain::{
    DomainError, DomainResult, IotRepository, Registry, TxCallback, UserRepository,
};

use crate::client::PostgresClient;
use crate::iot_repo::{PgExecutor, PgIotRepository};
use crate::user_repo::PgUserRepository;

/// Relational registry. Repositories outside a transaction scope write
/// through the pool; `do_in_tx` derives a child registry bound to one open
/// transaction.
pub struct PostgresRegistry {
    client: PostgresClient,
    iot: PgIotRepository<'static>,
    user: PgUserRepository<'static>,
}

impl PostgresRegistry {
    pub fn new(client: PostgresClient) -> Self {
        Self {
            iot: PgIotRepository::new(PgExecutor::Pool(client.clone())),
            user: PgUserRepository::new(PgExecutor::Pool(client.clone())),
            client,
        }
    }
}

#[async_trait]
impl Registry for PostgresRegistry {
    fn iot(&self) -> &dyn IotRepository {
        &self.iot
    }

    fn user(&self) -> Option<&dyn UserRepository> {
        Some(&self.user)
    }

    async fn do_in_tx(&self, f: TxCallback) -> DomainResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let child = PgTxRegistry {
            iot: PgIotRepository::new(PgExecutor::Tx(&tx)),
            user: PgUserRepository::new(PgExecutor::Tx(&tx)),
        };

        // An error (or unwind) drops the transaction, which rolls back.
        f(&child).await?;

        tx.commit()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("transaction committed");
        Ok(())
    }
}

/// Child registry whose repositories hold the transaction handle. Lives no
/// longer than the `do_in_tx` callback.
struct PgTxRegistry<'t> {
    iot: PgIotRepository<'t>,
    user: PgUserRepository<'t>,
}

#[async_trait]
impl Registry for PgTxRegistry<'_> {
    fn iot(&self) -> &dyn IotRepository {
        &self.iot
    }

    fn user(&self) -> Option<&dyn UserRepository> {
        Some(&self.user)
    }

    async fn do_in_tx(&self, _f: TxCallback) -> DomainResult<()> {
        Err(DomainError::NestedTransaction)
    }
}
