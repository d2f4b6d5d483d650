use procurement_assistant::{agent::AssistantCore, api::start_server, config::AppConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    let port = config.api_port;

    info!("Procurement Assistant - API Server");
    info!(port, model = %config.model, "Configuration loaded");

    let core = Arc::new(AssistantCore::from_config(config).await?);

    info!("Assistant initialized");

    start_server(Arc::clone(&core), port).await?;

    core.shutdown().await?;
    Ok(())
}
