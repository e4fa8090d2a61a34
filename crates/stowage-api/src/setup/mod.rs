//! Application setup and initialization

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use anyhow::Result;
use std::sync::Arc;

use stowage_core::Config;

use crate::state::AppState;
pub use services::BackgroundTasks;

/// Initialize the entire application: telemetry, then everything [`build_app`] does.
pub async fn initialize_app(
    config: Config,
) -> Result<(Arc<AppState>, axum::Router, BackgroundTasks)> {
    crate::telemetry::init_telemetry()?;
    tracing::info!(environment = %config.environment, "Configuration loaded and validated");

    build_app(config).await
}

/// Open the database, build services, start background workers and assemble the
/// router. Does not touch global state, so tests can build many apps per process.
pub async fn build_app(config: Config) -> Result<(Arc<AppState>, axum::Router, BackgroundTasks)> {
    config.validate()?;

    let db = database::setup_database(&config).await?;
    let (state, background) = services::initialize_services(&config, db).await?;
    let router = routes::setup_routes(&config, state.clone())?;

    Ok((state, router, background))
}
