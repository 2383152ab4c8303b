use anyhow::Context;
use dotenvy::dotenv;
use std::future::IntoFuture;
use std::sync::Arc;
use tracing::{info, warn};

use reelflow::app::{bootstrap, create_app, init_tracing};
use reelflow::config::settings::AppConfig;
use reelflow::infrastructure::storage::provision::spawn_notification_setup;
use reelflow::modules::live::hub::EventHub;
use reelflow::modules::live::relay::AssetEventRelay;
use reelflow::modules::webhooks::service::IngestionService;
use reelflow::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    info!("Starting server...");

    let config = AppConfig::new().context("missing required configuration")?;
    let services = bootstrap(config).await?;

    // Runs in the background: the object store checks the webhook target,
    // which only answers once this server is listening.
    spawn_notification_setup(
        services.storage.clone(),
        services.config.storage_notify_arn.clone(),
    );

    let ingestion = IngestionService::new(
        services.uploads.clone(),
        Arc::new(services.bus.clone()),
        services.subjects.clone(),
    );

    let hub = EventHub::default();
    let relay = services
        .bus
        .subscribe_exclusive(&services.subjects.asset_processed(), AssetEventRelay::new(hub.clone()))
        .await
        .context("failed to subscribe to processed events")?;

    let state = AppState::new(
        services.uploads.clone(),
        Arc::new(services.storage.clone()),
        ingestion,
        hub,
    );
    let app = create_app(state);

    let addr = format!("0.0.0.0:{}", services.config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server running on http://{}", addr);

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served.context("server error"),
        ended = relay => {
            warn!("Processed event relay ended: {:?}", ended);
            anyhow::bail!("processed event relay stopped")
        }
    }
}
