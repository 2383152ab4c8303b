use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::settings::AppConfig;
use crate::infrastructure::db::pool::{DbPool, connect_to_db};
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::storage::provision::provision_bucket;
use crate::infrastructure::storage::s3::StorageService;
use crate::modules::uploads::events::Subjects;
use crate::modules::uploads::repository::PgUploadRegistry;
use crate::modules::uploads::service::UploadService;
use crate::state::AppState;
use crate::workers::TRANSCODE_GROUP;

/// `RUST_LOG` wins; defaults to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Connections and provisioned resources shared by the API and the worker.
pub struct Services {
    pub config: AppConfig,
    pub db: DbPool,
    pub storage: StorageService,
    pub bus: RabbitMqService,
    pub subjects: Subjects,
    pub uploads: UploadService,
}

/// Connects to the database, object store and broker, runs migrations and
/// provisions the bucket, the event stream and the transcode group. Every
/// step is idempotent, so any number of processes may run it concurrently.
pub async fn bootstrap(config: AppConfig) -> anyhow::Result<Services> {
    let db = connect_to_db(&config.database_url)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("failed to run migrations")?;
    info!("✅ Migrations applied");

    let storage = StorageService::new(&config);
    provision_bucket(&storage).await;

    let bus = RabbitMqService::new(&config.amqp_url, config.ack_wait())
        .await
        .context("failed to connect to event bus")?;
    let subjects = Subjects::new(&config.event_namespace);
    bus.ensure_stream(&subjects.stream(), &[subjects.stream_pattern().as_str()])
        .await
        .context("failed to provision event stream")?;
    bus.ensure_group(&subjects.uploaded(), TRANSCODE_GROUP)
        .await
        .context("failed to provision transcode group")?;

    let uploads = UploadService::new(
        Arc::new(PgUploadRegistry::new(db.clone())),
        Arc::new(storage.clone()),
    );

    Ok(Services {
        config,
        db,
        storage,
        bus,
        subjects,
        uploads,
    })
}

/// Media bytes go straight to the bucket, so API bodies are small JSON.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn create_app(state: AppState) -> Router {
    crate::routes::configure_routes()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}
