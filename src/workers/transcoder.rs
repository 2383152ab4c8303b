use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::encoder::{Encoder, VariantSpec};
use crate::common::error::AppError;
use crate::infrastructure::queue::{BusMessage, EventPublisher, MessageHandler, publish_json};
use crate::infrastructure::storage::ObjectStore;
use crate::modules::uploads::events::{AssetProcessedEvent, DeadLetter, Subjects, UploadedEvent};
use crate::modules::uploads::keys::{self, STREAMING_PREFIX};
use crate::modules::uploads::model::{Asset, AssetStatus, NewAsset, UploadStatus};
use crate::modules::uploads::repository::RegistryError;
use crate::modules::uploads::service::{Transition, UploadService};

/// Steps of one processing attempt, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    KeyParsed,
    MarkedProcessing,
    Workspace,
    Downloaded,
    Encoded,
    VariantsUploaded,
    AssetRecorded,
    MarkedReady,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::KeyParsed => "parse key",
            Stage::MarkedProcessing => "mark processing",
            Stage::Workspace => "create workspace",
            Stage::Downloaded => "download source",
            Stage::Encoded => "encode",
            Stage::VariantsUploaded => "upload variants",
            Stage::AssetRecorded => "record asset",
            Stage::MarkedReady => "mark ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{stage} failed for {key}: {source}")]
pub struct AttemptError {
    pub key: String,
    pub stage: Stage,
    #[source]
    pub source: AppError,
}

impl AttemptError {
    fn at(stage: Stage, key: &str, source: impl Into<AppError>) -> Self {
        Self {
            key: key.to_string(),
            stage,
            source: source.into(),
        }
    }

    /// Failures that no amount of redelivery can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self.source, AppError::MalformedEvent(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed { asset_id: Uuid, upload_id: Uuid },
    AlreadyReady,
    /// Another worker holds an unexpired lease.
    ClaimedElsewhere {
        holder: Option<String>,
        until: Option<OffsetDateTime>,
    },
    /// The upload is in a state this pipeline does not advance from.
    NotEligible(UploadStatus),
}

#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    pub worker_name: String,
    /// Renewed every third of its length while an attempt runs.
    pub claim_lease: Duration,
    /// Upper bound on how long a delivery blocked by a foreign lease is held
    /// before it goes back to the broker.
    pub lease_retry_delay: Duration,
    pub max_delivery_attempts: u32,
    pub variants: Vec<VariantSpec>,
}

/// Consumer of `<ns>.uploaded`: downloads the raw object, encodes the HLS
/// ladder, uploads it, records the asset and marks the upload ready.
#[derive(Clone)]
pub struct TranscodeWorker {
    uploads: UploadService,
    storage: Arc<dyn ObjectStore>,
    bus: Arc<dyn EventPublisher>,
    encoder: Arc<dyn Encoder>,
    subjects: Subjects,
    settings: TranscoderSettings,
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        _ => "application/octet-stream",
    }
}

/// Every regular file below `root`, sorted so uploads happen in a stable order.
async fn collect_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// How long to hold a delivery that met a foreign lease before handing it
/// back: never past the lease expiry, never more than `cap`.
fn lease_wait(until: Option<OffsetDateTime>, now: OffsetDateTime, cap: Duration) -> Duration {
    until
        .map(|expires| expires - now)
        .filter(|left| left.is_positive())
        .map(|left| left.unsigned_abs())
        .unwrap_or(Duration::ZERO)
        .min(cap)
}

/// Storage key for a file under the local streaming root, always `/`-separated.
fn streaming_key(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!("{}/{}", STREAMING_PREFIX, parts.join("/")))
}

impl TranscodeWorker {
    pub fn new(
        uploads: UploadService,
        storage: Arc<dyn ObjectStore>,
        bus: Arc<dyn EventPublisher>,
        encoder: Arc<dyn Encoder>,
        subjects: Subjects,
        settings: TranscoderSettings,
    ) -> Self {
        Self {
            uploads,
            storage,
            bus,
            encoder,
            subjects,
            settings,
        }
    }

    /// One processing attempt. Before returning an error for a claimed
    /// upload the lease is released, so a redelivery can pick it up at once.
    pub async fn process(&self, event: &UploadedEvent) -> Result<AttemptOutcome, AttemptError> {
        let key = event.s3_key.as_str();
        let upload_id = keys::parse_upload_id(key)
            .map_err(|e| AttemptError::at(Stage::KeyParsed, key, AppError::MalformedEvent(e.to_string())))?;
        if upload_id != event.upload_id {
            warn!(key, event_upload_id = %event.upload_id, "Event upload id disagrees with key, using key");
        }

        let worker = self.settings.worker_name.as_str();
        match self
            .uploads
            .mark_processing(key, worker, self.settings.claim_lease)
            .await
            .map_err(|e| AttemptError::at(Stage::MarkedProcessing, key, e))?
        {
            Transition::Applied(_) => info!(key, worker, "Claimed upload for processing"),
            Transition::Skipped(upload) => {
                return Ok(match upload.status {
                    UploadStatus::Ready => AttemptOutcome::AlreadyReady,
                    UploadStatus::Processing => AttemptOutcome::ClaimedElsewhere {
                        holder: upload.claimed_by,
                        until: upload.claim_expires_at,
                    },
                    other => AttemptOutcome::NotEligible(other),
                });
            }
        }

        match self.run_with_renewal(key, upload_id).await {
            Ok(asset_id) => Ok(AttemptOutcome::Completed { asset_id, upload_id }),
            Err(err) => {
                if let Err(e) = self.uploads.release_claim(key, worker).await {
                    warn!(key, "Failed to release claim: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Runs the claimed attempt while keeping the lease alive, so a crashed
    /// holder is detected within one lease length however long encoding takes.
    async fn run_with_renewal(&self, key: &str, upload_id: Uuid) -> Result<Uuid, AttemptError> {
        let every = (self.settings.claim_lease / 3).max(Duration::from_secs(1));
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        let work = self.run_claimed(key, upload_id);
        tokio::pin!(work);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renewals.tick() => self.renew_claim(key).await,
            }
        }
    }

    async fn renew_claim(&self, key: &str) {
        let worker = self.settings.worker_name.as_str();
        match self.uploads.mark_processing(key, worker, self.settings.claim_lease).await {
            Ok(Transition::Applied(_)) => debug!(key, worker, "Renewed processing lease"),
            Ok(Transition::Skipped(upload)) if upload.status == UploadStatus::Processing => warn!(
                key,
                worker,
                holder = ?upload.claimed_by,
                "Lost processing lease"
            ),
            Ok(Transition::Skipped(upload)) => debug!(key, status = %upload.status, "Lease no longer needed"),
            Err(e) => warn!(key, worker, "Failed to renew processing lease: {}", e),
        }
    }

    async fn run_claimed(&self, key: &str, upload_id: Uuid) -> Result<Uuid, AttemptError> {
        // An earlier attempt may have recorded the asset and died before
        // marking the upload ready; finish that one instead of encoding again.
        let existing = self
            .uploads
            .registry()
            .find_asset_by_upload(upload_id)
            .await
            .map_err(|e| AttemptError::at(Stage::AssetRecorded, key, e))?;

        let asset = match existing {
            Some(asset) => {
                info!(key, asset_id = %asset.id, "Asset already recorded, resuming");
                asset
            }
            None => self.encode_and_record(key, upload_id).await?,
        };

        match self
            .uploads
            .mark_ready(key, &self.settings.worker_name)
            .await
            .map_err(|e| AttemptError::at(Stage::MarkedReady, key, e))?
        {
            Transition::Applied(_) => {}
            Transition::Skipped(upload) => {
                return Err(AttemptError::at(
                    Stage::MarkedReady,
                    key,
                    AppError::Conflict(format!(
                        "upload is {} and claimed by {:?}",
                        upload.status, upload.claimed_by
                    )),
                ));
            }
        }
        info!(key, asset_id = %asset.id, "✅ Upload ready");

        let event = AssetProcessedEvent {
            asset_id: asset.id,
            upload_id,
            status: AssetStatus::Ready,
        };
        if let Err(e) = publish_json(self.bus.as_ref(), &self.subjects.asset_processed(), &event).await {
            warn!(key, asset_id = %asset.id, "Failed to publish processed event: {}", e);
        }

        Ok(asset.id)
    }

    async fn encode_and_record(&self, key: &str, upload_id: Uuid) -> Result<Asset, AttemptError> {
        // Removed on drop, whichever way this function exits.
        let workspace = tempfile::Builder::new()
            .prefix("reelflow-")
            .tempdir()
            .map_err(|e| AttemptError::at(Stage::Workspace, key, AppError::Io(e.to_string())))?;

        let filename = key.rsplit('/').next().unwrap_or(key);
        let input = workspace.path().join(filename);
        info!(key, "⬇️ Downloading source");
        self.storage
            .download(key, &input)
            .await
            .map_err(|e| AttemptError::at(Stage::Downloaded, key, e))?;

        let asset_id = Uuid::new_v4();
        let output_root = workspace.path().join(STREAMING_PREFIX);
        let asset_dir = output_root.join(asset_id.to_string());
        self.encoder
            .encode(&input, &asset_dir, &self.settings.variants)
            .await
            .map_err(|e| AttemptError::at(Stage::Encoded, key, e))?;

        let uploaded = self
            .upload_tree(&output_root)
            .await
            .map_err(|e| AttemptError::at(Stage::VariantsUploaded, key, e))?;
        info!(key, %asset_id, files = uploaded, "⬆️ Uploaded HLS output");

        self.uploads
            .registry()
            .create_asset(NewAsset {
                id: asset_id,
                upload_id,
                hls_root: keys::master_playlist_key(asset_id),
            })
            .await
            .map_err(|e| AttemptError::at(Stage::AssetRecorded, key, e))
    }

    async fn upload_tree(&self, root: &Path) -> Result<usize, AppError> {
        let files = collect_files(root).await.map_err(|e| AppError::Io(e.to_string()))?;
        for file in &files {
            let key = streaming_key(root, file)
                .ok_or_else(|| AppError::Io(format!("{} is outside {}", file.display(), root.display())))?;
            self.storage.upload(&key, file, content_type_for(file)).await?;
        }
        Ok(files.len())
    }

    /// Parks the message on the dead-letter subject. Returns false when even
    /// that publish failed, in which case the message must stay with the broker.
    async fn dead_letter(&self, message: &BusMessage, reason: String) -> bool {
        let letter = DeadLetter {
            subject: message.subject.clone(),
            reason,
            delivery_attempt: message.delivery_attempt,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        };
        let subject = self.subjects.dead_letter();
        match publish_json(self.bus.as_ref(), &subject, &letter).await {
            Ok(()) => {
                warn!(subject = %letter.subject, reason = %letter.reason, "Message dead-lettered");
                true
            }
            Err(e) => {
                error!(subject = %letter.subject, "Failed to dead-letter message: {}", e);
                false
            }
        }
    }

    async fn give_up(&self, message: &BusMessage, event: &UploadedEvent) -> bool {
        let mut reason = format!(
            "gave up after {} delivery attempts",
            message.delivery_attempt.saturating_sub(1)
        );

        // A live foreign lease means another worker is still on it: park this
        // copy of the message but leave the upload to its holder.
        let holder = match self.uploads.registry().find_by_key(&event.s3_key).await {
            Ok(Some(upload))
                if upload.status == UploadStatus::Processing
                    && !upload.claimable_by(&self.settings.worker_name, OffsetDateTime::now_utc()) =>
            {
                upload.claimed_by
            }
            Ok(_) => None,
            Err(e) => {
                error!(key = %event.s3_key, "Failed to look up upload: {}", e);
                return false;
            }
        };
        if let Some(holder) = &holder {
            reason.push_str(&format!("; upload still leased by {}", holder));
        }

        if !self.dead_letter(message, reason).await {
            return false;
        }
        if holder.is_some() {
            return true;
        }

        match self.uploads.mark_failed(&event.s3_key).await {
            Ok(Transition::Applied(_)) => {
                warn!(key = %event.s3_key, "Upload marked failed");
                true
            }
            Ok(Transition::Skipped(upload)) => {
                info!(key = %event.s3_key, status = %upload.status, "Upload left as is");
                true
            }
            Err(RegistryError::NotFound(_)) => true,
            Err(e) => {
                error!(key = %event.s3_key, "Failed to mark upload failed: {}", e);
                false
            }
        }
    }
}

async fn settle(message: BusMessage, ack: bool) {
    let subject = message.subject.clone();
    let result = if ack { message.ack().await } else { message.nak().await };
    if let Err(e) = result {
        error!(subject = %subject, "Failed to settle message: {}", e);
    }
}

#[async_trait]
impl MessageHandler for TranscodeWorker {
    async fn handle(&self, message: BusMessage) {
        let event: UploadedEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                error!(subject = %message.subject, "Failed to decode uploaded event: {}", e);
                let parked = self.dead_letter(&message, format!("undecodable payload: {}", e)).await;
                settle(message, parked).await;
                return;
            }
        };

        if message.delivery_attempt > self.settings.max_delivery_attempts {
            let done = self.give_up(&message, &event).await;
            settle(message, done).await;
            return;
        }

        info!(
            key = %event.s3_key,
            attempt = message.delivery_attempt,
            "📦 Received uploaded event"
        );

        match self.process(&event).await {
            Ok(AttemptOutcome::Completed { asset_id, .. }) => {
                info!(key = %event.s3_key, %asset_id, "Processing complete");
                settle(message, true).await;
            }
            Ok(AttemptOutcome::ClaimedElsewhere { holder, until }) => {
                let wait = lease_wait(until, OffsetDateTime::now_utc(), self.settings.lease_retry_delay);
                info!(
                    key = %event.s3_key,
                    ?holder,
                    attempt = message.delivery_attempt,
                    wait_ms = wait.as_millis() as u64,
                    "Upload leased elsewhere, handing back for redelivery"
                );
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                settle(message, false).await;
            }
            Ok(outcome) => {
                info!(key = %event.s3_key, ?outcome, "Skipping uploaded event");
                settle(message, true).await;
            }
            Err(err) if err.is_permanent() => {
                error!(key = %err.key, stage = %err.stage, "Processing can never succeed: {}", err.source);
                let parked = self.dead_letter(&message, err.to_string()).await;
                settle(message, parked).await;
            }
            Err(err) => {
                error!(
                    key = %err.key,
                    stage = %err.stage,
                    attempt = message.delivery_attempt,
                    "Processing failed: {}",
                    err.source
                );
                settle(message, false).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for(Path::new("master.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for(Path::new("v0_segment000.ts")), "video/mp2t");
        assert_eq!(content_type_for(Path::new("init.m4s")), "video/iso.segment");
        assert_eq!(content_type_for(Path::new("poster.jpg")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("README")), "application/octet-stream");
    }

    #[test]
    fn streaming_keys_are_slash_separated() {
        let root = Path::new("/tmp/ws/hls");
        let file = root.join("a1").join("v0.m3u8");
        assert_eq!(streaming_key(root, &file).as_deref(), Some("hls/a1/v0.m3u8"));
        assert_eq!(streaming_key(root, Path::new("/elsewhere/x.ts")), None);
    }

    #[tokio::test]
    async fn collects_nested_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a1");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("v1.m3u8"), b"#EXTM3U").await.unwrap();
        tokio::fs::write(nested.join("master.m3u8"), b"#EXTM3U").await.unwrap();

        let files = collect_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .filter_map(|f| f.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, ["master.m3u8", "v1.m3u8"]);
    }

    #[test]
    fn lease_wait_is_capped_by_expiry_and_retry_delay() {
        let now = OffsetDateTime::now_utc();
        let cap = Duration::from_secs(30);
        assert_eq!(lease_wait(Some(now + time::Duration::hours(1)), now, cap), cap);
        assert_eq!(
            lease_wait(Some(now + time::Duration::seconds(5)), now, cap),
            Duration::from_secs(5)
        );
        assert_eq!(lease_wait(Some(now - time::Duration::seconds(5)), now, cap), Duration::ZERO);
        assert_eq!(lease_wait(None, now, cap), Duration::ZERO);
    }

    #[test]
    fn malformed_key_is_permanent() {
        let err = AttemptError::at(Stage::KeyParsed, "bad", AppError::MalformedEvent("bad".into()));
        assert!(err.is_permanent());
        let err = AttemptError::at(Stage::Encoded, "original/x.mp4", AppError::EncodeFailed("exit 1".into()));
        assert!(!err.is_permanent());
    }
}
