use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use sensornet_domain::{DomainError, DomainResult, User, UserRepository};

use crate::iot_repo::PgExecutor;

/// PostgreSQL user storage for the HTTP surface.
pub struct PgUserRepository<'a> {
    conn: PgExecutor<'a>,
}

impl<'a> PgUserRepository<'a> {
    pub(crate) fn new(conn: PgExecutor<'a>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository<'_> {
    async fn create_user(&self, username: &str, password_hash: &str) -> DomainResult<User> {
        let now = Utc::now();
        let row = self
            .conn
            .query_opt(
                "INSERT INTO users (username, password_hash, created_at) \
                 VALUES ($1, $2, $3) ON CONFLICT (username) DO NOTHING RETURNING id",
                &[&username, &password_hash, &now],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.context("creating user")))?;

        let Some(row) = row else {
            return Err(DomainError::UserAlreadyExists(username.to_string()));
        };

        debug!(username, "registered user");
        Ok(User {
            id: row.get(0),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now,
        })
    }

    async fn get_user(&self, username: &str) -> DomainResult<Option<User>> {
        let row = self
            .conn
            .query_opt(
                "SELECT id, username, password_hash, created_at FROM users WHERE username = $1",
                &[&username],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.context("querying user")))?;

        Ok(row.map(|row| User {
            id: row.get(0),
            username: row.get(1),
            password_hash: row.get(2),
            created_at: row.get(3),
        }))
    }
}
