mod bootstrap;
mod chain;
mod config;
mod error;
mod investment;
mod settlement;
mod vault;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,settlement_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting cross-chain investment settlement reconciler");

    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    let state = bootstrap::initialize(&config).await?;

    let pending = state.service.list_pending().await?;
    info!("📋 {} investments pending settlement", pending.len());

    let handle = state.reconciler.start();
    info!("⏰ Reconciler sweeping every {}s", config.sweep_interval_secs);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing current sweep");
    state.reconciler.stop();
    handle.await?;

    Ok(())
}
