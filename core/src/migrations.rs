use std::{error::Error, fmt, time::Duration};

use async_trait::async_trait;
use outpost_helpers::redis::ConnectionWrapper;
use tracing::{info, warn};

use crate::consts::{
    log_retention_ttl_key, migration_state_key, MIGRATION_LOCK_KEY, MIGRATION_LOCK_TTL_MS,
    SCHEMA_VERSION_KEY,
};

/// Provides a custom error type to be used for failures
/// in running schema migrations.
#[derive(Debug)]
pub enum MigrationError {
    Redis(redis::RedisError),
    Apply { name: String, reason: String },
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigrationError::Redis(err) => write!(f, "migration error: {err}"),
            MigrationError::Apply { name, reason } => {
                write!(f, "migration error: {name} failed to apply: {reason}")
            }
        }
    }
}

impl Error for MigrationError {}

impl From<redis::RedisError> for MigrationError {
    fn from(error: redis::RedisError) -> Self {
        MigrationError::Redis(error)
    }
}

/// The recorded lifecycle state of one named migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Running,
    Completed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Pending => "pending",
            MigrationState::Running => "running",
            MigrationState::Completed => "completed",
        }
    }
}

/// One schema migration for the Redis-backed entity store.
#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    /// Migrations are ordered and applied by version, the stored schema
    /// version advances as each one completes.
    fn version(&self) -> u32;

    async fn apply(&self, connection: &mut ConnectionWrapper) -> Result<(), MigrationError>;
}

/// The baseline layout: tenant keys carry `{tenant_id}` hash tags so a
/// tenant's records colocate in one cluster slot. Fresh deployments are
/// created on this layout, there is nothing to transform.
struct TenantHashTagKeys {}

#[async_trait]
impl Migration for TenantHashTagKeys {
    fn name(&self) -> &str {
        "tenant_hashtag_keys"
    }

    fn version(&self) -> u32 {
        1
    }

    async fn apply(&self, _connection: &mut ConnectionWrapper) -> Result<(), MigrationError> {
        Ok(())
    }
}

/// The migrations every deployment runs at startup.
pub fn default_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(TenantHashTagKeys {})]
}

/// Applies pending schema migrations under a cross-process Redis lock.
///
/// Only one process migrates at a time, contenders skip and rely on the
/// winner. A crashed migrator frees the lock after its one hour TTL.
pub struct Migrator {
    connection: ConnectionWrapper,
    migrations: Vec<Box<dyn Migration>>,
    owner: String,
}

impl Migrator {
    pub fn new(connection: ConnectionWrapper, migrations: Vec<Box<dyn Migration>>) -> Self {
        Self {
            connection,
            migrations,
            owner: nanoid::nanoid!(),
        }
    }

    pub async fn current_version(&self) -> Result<u32, MigrationError> {
        let mut connection = self.connection.clone();
        let version = connection.get(SCHEMA_VERSION_KEY).await?;
        Ok(version
            .as_deref()
            .and_then(|version| version.parse().ok())
            .unwrap_or(0))
    }

    /// Runs every pending migration, returning how many were applied.
    /// Returns zero without touching anything when another process
    /// holds the migration lock.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        let mut connection = self.connection.clone();
        let acquired = connection
            .pset_ex_nx(MIGRATION_LOCK_KEY, &self.owner, MIGRATION_LOCK_TTL_MS)
            .await?;
        if !acquired {
            info!("another process holds the migration lock, skipping migrations");
            return Ok(0);
        }

        let result = self.apply_pending(&mut connection).await;

        let released: i64 = connection
            .eval_script(
                include_str!("../lua-scripts/release_migration_lock.lua"),
                &[MIGRATION_LOCK_KEY],
                &[&self.owner],
            )
            .await
            .unwrap_or(0);
        if released == 0 {
            warn!("migration lock was not released, it expires with its TTL");
        }

        result
    }

    async fn apply_pending(
        &self,
        connection: &mut ConnectionWrapper,
    ) -> Result<usize, MigrationError> {
        let current = self.current_version().await?;
        let mut pending: Vec<&dyn Migration> = pending_migrations(&self.migrations, current);
        pending.sort_by_key(|migration| migration.version());

        let mut applied = 0;
        for migration in pending {
            info!(
                name = migration.name(),
                version = migration.version(),
                "applying schema migration"
            );
            connection
                .set(
                    &migration_state_key(migration.name()),
                    MigrationState::Running.as_str(),
                )
                .await?;
            migration.apply(connection).await?;
            connection
                .set(
                    &migration_state_key(migration.name()),
                    MigrationState::Completed.as_str(),
                )
                .await?;
            connection
                .set(SCHEMA_VERSION_KEY, &migration.version().to_string())
                .await?;
            applied += 1;
        }
        Ok(applied)
    }
}

fn pending_migrations(migrations: &[Box<dyn Migration>], current: u32) -> Vec<&dyn Migration> {
    migrations
        .iter()
        .map(|migration| migration.as_ref())
        .filter(|migration| migration.version() > current)
        .collect()
}

/// Records the log retention TTL applied to the log store for this
/// deployment, returning whether the recorded value changed. Applying
/// the retention to the store itself is the store's concern.
pub async fn record_log_retention_ttl(
    connection: &mut ConnectionWrapper,
    deployment_id: Option<&str>,
    ttl: Duration,
) -> Result<bool, MigrationError> {
    let key = log_retention_ttl_key(deployment_id);
    let recorded = connection.get(&key).await?;
    let ttl_seconds = ttl.as_secs().to_string();
    if recorded.as_deref() == Some(ttl_seconds.as_str()) {
        return Ok(false);
    }
    connection.set(&key, &ttl_seconds).await?;
    info!(ttl_seconds, "recorded log retention TTL");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct NoopMigration {
        name: &'static str,
        version: u32,
    }

    #[async_trait]
    impl Migration for NoopMigration {
        fn name(&self) -> &str {
            self.name
        }

        fn version(&self) -> u32 {
            self.version
        }

        async fn apply(&self, _connection: &mut ConnectionWrapper) -> Result<(), MigrationError> {
            Ok(())
        }
    }

    #[test]
    fn test_pending_migrations_filters_applied_versions() {
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(NoopMigration {
                name: "one",
                version: 1,
            }),
            Box::new(NoopMigration {
                name: "two",
                version: 2,
            }),
            Box::new(NoopMigration {
                name: "three",
                version: 3,
            }),
        ];

        let pending = pending_migrations(&migrations, 1);
        let names: Vec<&str> = pending.iter().map(|migration| migration.name()).collect();
        assert_eq!(names, vec!["two", "three"]);

        assert!(pending_migrations(&migrations, 3).is_empty());
    }

    #[test]
    fn test_migration_states_serialize_to_stable_strings() {
        assert_eq!(MigrationState::Pending.as_str(), "pending");
        assert_eq!(MigrationState::Running.as_str(), "running");
        assert_eq!(MigrationState::Completed.as_str(), "completed");
    }
}
