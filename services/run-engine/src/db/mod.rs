//! Postgres pool for [`crate::repository::PgRunRepository`].

mod error;

pub use error::DbError;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::repository::PgRunRepository;

/// Pool sizing and timeouts. Built by [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `None` keeps runs in memory.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig, database_url: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(database_url)
            .await
            .map_err(DbError::Connect)?;

        info!(
            max_connections = config.max_connections,
            "Connected to run database"
        );
        Ok(Self { pool })
    }

    pub fn run_repository(&self) -> PgRunRepository {
        PgRunRepository::new(self.pool.clone())
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Applies `migrations/` from the crate or the working directory.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = [
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
            PathBuf::from("services/run-engine/migrations"),
            PathBuf::from("migrations"),
        ];
        let dir = candidates
            .iter()
            .find(|dir| dir.is_dir())
            .ok_or_else(|| DbError::MigrationDirNotFound {
                tried: describe(&candidates),
            })?;

        let migrator = Migrator::new(dir.as_path())
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(migrations_dir = %dir.display(), "Run database migrated");
        Ok(())
    }
}

fn describe(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_select_memory_storage() {
        let config = DbConfig::default();
        assert!(config.database_url.is_none());
        assert!(config.min_connections <= config.max_connections);
    }

    #[test]
    fn test_describe_lists_every_candidate() {
        let tried = describe(&[PathBuf::from("a/migrations"), PathBuf::from("migrations")]);
        assert_eq!(tried, "a/migrations, migrations");
    }
}
