use anyhow::Context;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::{info, warn};

use reelflow::app::{bootstrap, init_tracing};
use reelflow::config::settings::{AppConfig, IngressMode};
use reelflow::modules::webhooks::service::IngestionService;
use reelflow::workers::encoder::{FfmpegEncoder, VariantSpec};
use reelflow::workers::ingest::NotificationConsumer;
use reelflow::workers::transcoder::{TranscodeWorker, TranscoderSettings};
use reelflow::workers::{DEAD_LETTER_GROUP, INGEST_GROUP, TRANSCODE_GROUP};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let config = AppConfig::new().context("missing required configuration")?;
    let services = bootstrap(config).await?;
    let config = &services.config;
    let subjects = &services.subjects;
    let bus = &services.bus;

    bus.ensure_group(&subjects.dead_letter(), DEAD_LETTER_GROUP)
        .await
        .context("failed to provision dead-letter group")?;

    let worker = TranscodeWorker::new(
        services.uploads.clone(),
        Arc::new(services.storage.clone()),
        Arc::new(bus.clone()),
        Arc::new(FfmpegEncoder::new(config.ffmpeg_path.clone(), config.hls_segment_secs)),
        subjects.clone(),
        TranscoderSettings {
            worker_name: config.worker_name.clone(),
            claim_lease: config.claim_lease(),
            lease_retry_delay: config.lease_retry_delay(),
            max_delivery_attempts: config.max_delivery_attempts,
            variants: VariantSpec::default_ladder(),
        },
    );

    let mut consumers = vec![
        bus.subscribe(&subjects.uploaded(), TRANSCODE_GROUP, worker)
            .await
            .context("failed to subscribe transcode worker")?,
    ];

    if config.ingress_mode == IngressMode::Bus {
        let ingestion = IngestionService::new(
            services.uploads.clone(),
            Arc::new(bus.clone()),
            subjects.clone(),
        );
        consumers.push(
            bus.subscribe(&subjects.storage_events(), INGEST_GROUP, NotificationConsumer::new(ingestion))
                .await
                .context("failed to subscribe storage notification consumer")?,
        );
    }

    info!(
        worker = %config.worker_name,
        ingress = ?config.ingress_mode,
        "🎥 Transcoder worker listening on {}",
        subjects.uploaded()
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down worker");
            Ok(())
        }
        (ended, index, _) = futures_util::future::select_all(consumers) => {
            warn!(consumer = index, "Consumer ended: {:?}", ended);
            anyhow::bail!("event consumer stopped")
        }
    }
}
