use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use capacity_guard::app::{spawn_tasks, AppState};
use capacity_guard::config::AppConfig;
use capacity_guard::flow::registry::InProcessFlowRegistry;
use capacity_guard::price_level::StaticPriceSource;
use capacity_guard::sdk::simulated::InMemoryDeviceSdk;
use capacity_guard::settings::json_file::JsonFileSettingsStore;
use capacity_guard::telemetry::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config.telemetry);

    let settings = Arc::new(
        JsonFileSettingsStore::open(config.settings_store.path.clone())
            .await
            .context("failed to open settings store")?,
    );
    let sdk = Arc::new(InMemoryDeviceSdk::new());
    let flow = Arc::new(InProcessFlowRegistry::new());
    let price_source = Arc::new(StaticPriceSource::empty());

    let (app_state, rebuild_rx) = AppState::new(config.clone(), sdk, settings, flow, price_source)
        .await
        .context("failed to initialise app state")?;

    let addr = config.server.socket_addr()?;
    let router = capacity_guard::api::router(app_state.clone(), &config.server);

    info!(%addr, "starting capacity-guard controller");

    let task_handles = spawn_tasks(app_state, rebuild_rx);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in task_handles {
        handle.abort();
    }

    warn!("shutdown complete");
    Ok(())
}
