use stowage_api::setup;
use stowage_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // A missing .env file is fine; the environment may already be populated.
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let (_state, router, background) = setup::initialize_app(config.clone()).await?;

    let served = setup::server::start_server(&config, router).await;

    background.shutdown().await;
    tracing::info!("Shutdown complete");
    served
}
