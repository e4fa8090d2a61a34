//! Database initialization

use anyhow::{Context, Result};
use stowage_core::Config;
use stowage_db::{Database, DatabaseSettings};

/// Open the metadata store and apply pending migrations.
pub async fn setup_database(config: &Config) -> Result<Database> {
    let settings = DatabaseSettings::from_config(config);
    Database::open(&settings)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database_path))
}
