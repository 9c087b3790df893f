use financial_agent_audit::{
    api::{start_server, ApiState},
    config::AppConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    info!("🚀 Financial Agent Audit Pipeline - API Server");
    info!("📍 Port: {}", config.port);
    info!("📒 Ledger: {}", config.ledger_dir.display());
    if config.database_url.is_none() {
        info!("POSTGRES_URL not set, telemetry is kept in memory");
    }

    let state = ApiState::from_config(&config).await?;
    let tip = state.ledger.tip_commitment().await;
    info!(
        "✅ Ledger ready at sequence {} (epoch {}, tip {})",
        tip.sequence_no, tip.epoch, tip.hash
    );

    info!("📡 Starting API server...");
    start_server(state, config.port).await?;

    Ok(())
}
