//! Database setup and initialization

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stowage_core::Config;

use super::writer::DbWriter;

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub max_read_connections: u32,
    pub acquire_timeout: Duration,
    /// `None` = unbounded write queue.
    pub write_queue_capacity: Option<usize>,
}

impl DatabaseSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: PathBuf::from(&config.database_path),
            max_read_connections: config.db_max_connections.max(1),
            acquire_timeout: Duration::from_secs(config.db_timeout_seconds),
            write_queue_capacity: config.write_queue_capacity,
        }
    }

    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_read_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            write_queue_capacity: None,
        }
    }
}

/// Read pool plus the single writer.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
    pub writer: DbWriter,
}

impl Database {
    /// Open (creating if needed) the database file, run pending migrations and start
    /// the writer task.
    pub async fn open(settings: &DatabaseSettings) -> Result<Self> {
        if let Some(parent) = settings.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        tracing::info!(path = %settings.path.display(), "Opening database...");

        let options = SqliteConnectOptions::new()
            .filename(&settings.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(settings.acquire_timeout);

        // The writer owns the only connection that ever mutates the database.
        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options.clone())
            .await
            .context("Failed to open write connection")?;

        run_migrations(&write_pool).await?;

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_read_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(options)
            .await
            .context("Failed to open read pool")?;

        tracing::info!(
            max_read_connections = settings.max_read_connections,
            write_queue_capacity = ?settings.write_queue_capacity,
            "Database connected successfully"
        );

        let writer = DbWriter::spawn(write_pool, settings.write_queue_capacity);
        Ok(Self { pool, writer })
    }
}

/// Run pending migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .context("Failed to load migrations")?;
    migrator
        .run(pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fresh database in a temporary directory. Keep the `TempDir` alive for the test.
    pub async fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&DatabaseSettings::for_path(dir.path().join("test.db")))
            .await
            .unwrap();
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_schema() {
        let (_dir, db) = test_support::open_temp().await;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        assert_eq!(
            tables,
            vec![
                "file_upload_parts",
                "file_uploads",
                "files",
                "folders",
                "queue_jobs",
                "storages",
                "workspaces"
            ]
        );
    }

    #[tokio::test]
    async fn reopening_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DatabaseSettings::for_path(dir.path().join("nested/stowage.db"));
        drop(Database::open(&settings).await.unwrap());
        assert!(Database::open(&settings).await.is_ok());
    }
}
