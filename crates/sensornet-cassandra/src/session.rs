use std::sync::Arc;

use anyhow::{Context, Result};
use scylla::statement::Consistency;
use scylla::{Session, SessionBuilder};
use tracing::{debug, info};

/// Cassandra session wrapper carrying the per-operation consistency level.
#[derive(Clone)]
pub struct CassandraSession {
    session: Arc<Session>,
    consistency: Consistency,
}

impl CassandraSession {
    pub async fn connect(hosts: &[String], keyspace: &str, consistency: Consistency) -> Result<Self> {
        info!(?hosts, keyspace, ?consistency, "connecting to cassandra");

        let session = SessionBuilder::new()
            .known_nodes(hosts)
            .build()
            .await
            .context("creating cassandra session")?;

        session
            .use_keyspace(keyspace, false)
            .await
            .with_context(|| format!("switching to keyspace {keyspace}"))?;

        Ok(Self {
            session: Arc::new(session),
            consistency,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.session
            .query_unpaged("SELECT release_version FROM system.local", ())
            .await
            .context("pinging cassandra")?;
        debug!("cassandra connection successful");
        Ok(())
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }
}

/// Map the configured consistency name onto the driver's levels. Unknown
/// values fall back to QUORUM.
pub fn parse_consistency(raw: &str) -> Consistency {
    match raw.to_ascii_uppercase().as_str() {
        "ALL" => Consistency::All,
        "ONE" => Consistency::One,
        "LOCAL_ONE" => Consistency::LocalOne,
        "LOCAL_QUORUM" => Consistency::LocalQuorum,
        _ => Consistency::Quorum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_parsing() {
        assert_eq!(parse_consistency("ALL"), Consistency::All);
        assert_eq!(parse_consistency("one"), Consistency::One);
        assert_eq!(parse_consistency("local_one"), Consistency::LocalOne);
        assert_eq!(parse_consistency("LOCAL_QUORUM"), Consistency::LocalQuorum);
        assert_eq!(parse_consistency("QUORUM"), Consistency::Quorum);
        assert_eq!(parse_consistency("anything"), Consistency::Quorum);
    }
}
