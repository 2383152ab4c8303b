use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::s3::StorageService;
use crate::modules::uploads::keys::{RAW_PREFIX, STREAMING_PREFIX};

/// Event types the bucket reports to the pipeline.
pub const OBJECT_CREATED_EVENTS: &[&str] = &["s3:ObjectCreated:Put"];

const NOTIFICATION_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bucket and read policy are provisioned inline; failures are logged and
/// startup continues, since the bucket may already be set up out of band.
pub async fn provision_bucket(storage: &StorageService) {
    if let Err(e) = storage.ensure_bucket_exists().await {
        error!("Failed to ensure bucket exists: {}", e);
    }

    if let Err(e) = storage.ensure_public_read_policy(STREAMING_PREFIX).await {
        error!("Failed to ensure public read policy: {}", e);
    }
}

/// The object store validates notification targets when they are
/// configured, and the target (this API's webhook or the broker) may not be
/// reachable yet. Retries on a fixed interval until `timeout` elapses.
pub fn spawn_notification_setup(storage: StorageService, target_arn: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        configure_notification_with_retry(
            &storage,
            &target_arn,
            NOTIFICATION_RETRY_INTERVAL,
            NOTIFICATION_TIMEOUT,
        )
        .await;
    })
}

async fn configure_notification_with_retry(
    storage: &StorageService,
    target_arn: &str,
    interval: Duration,
    timeout: Duration,
) -> bool {
    let prefix = format!("{}/", RAW_PREFIX);
    let mut ticker = tokio::time::interval(interval);

    let attempt_loop = async {
        loop {
            ticker.tick().await;
            match storage
                .ensure_notification_configured(target_arn, OBJECT_CREATED_EVENTS, &prefix)
                .await
            {
                Ok(()) => return,
                Err(e) => warn!("Bucket notification not accepted yet: {}", e),
            }
        }
    };

    match tokio::time::timeout(timeout, attempt_loop).await {
        Ok(()) => {
            info!(target_arn, "Bucket notification configured successfully");
            true
        }
        Err(_) => {
            error!(target_arn, "Failed to configure bucket notification: timeout");
            false
        }
    }
}
