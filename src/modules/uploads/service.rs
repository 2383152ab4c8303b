use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use super::keys;
use super::model::{NewUpload, Upload, UploadStatus};
use super::repository::{Lease, RegistryResult, StatusChange, StatusUpdate, UploadRegistry};
use crate::common::error::AppError;
use crate::infrastructure::storage::ObjectStore;

/// Result of a transition that may be refused because the upload moved on.
#[derive(Debug, Clone)]
pub enum Transition {
    Applied(Upload),
    Skipped(Upload),
}

impl Transition {
    pub fn upload(&self) -> &Upload {
        match self {
            Transition::Applied(u) | Transition::Skipped(u) => u,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

impl From<StatusUpdate> for Transition {
    fn from(update: StatusUpdate) -> Self {
        match update {
            StatusUpdate::Applied(u) => Transition::Applied(u),
            StatusUpdate::Rejected(u) => Transition::Skipped(u),
        }
    }
}

/// Upload lifecycle: `pending → uploaded → processing → ready | failed`.
///
/// Every transition is keyed by storage key and conditional on the current
/// status, so redelivered events cannot move an upload backwards.
#[derive(Clone)]
pub struct UploadService {
    registry: Arc<dyn UploadRegistry>,
    storage: Arc<dyn ObjectStore>,
}

impl UploadService {
    pub fn new(registry: Arc<dyn UploadRegistry>, storage: Arc<dyn ObjectStore>) -> Self {
        Self { registry, storage }
    }

    pub fn registry(&self) -> &Arc<dyn UploadRegistry> {
        &self.registry
    }

    /// Allocates an upload slot and a presigned PUT URL scoped to its key.
    pub async fn create(&self, title: &str, filename: &str) -> Result<(Upload, String), AppError> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(AppError::InvalidRequest("filename is required".to_string()));
        }

        let id = Uuid::new_v4();
        let s3_key = keys::raw_key(id, filename);
        let upload_url = self.storage.presign_put(&s3_key).await?;

        let upload = self
            .registry
            .create(NewUpload {
                id,
                title: title.to_string(),
                s3_key,
            })
            .await?;

        info!(upload_id = %upload.id, key = %upload.s3_key, "Created upload slot");
        Ok((upload, upload_url))
    }

    pub async fn get(&self, id: Uuid) -> Result<Upload, AppError> {
        self.registry
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("upload {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<Upload>, AppError> {
        Ok(self.registry.list_all().await?)
    }

    async fn transition(&self, key: &str, change: StatusChange) -> RegistryResult<Transition> {
        let update = self.registry.update_status_by_key(key, &change).await?;
        let transition = Transition::from(update);
        debug!(
            key,
            next = %change.next,
            applied = transition.is_applied(),
            current = %transition.upload().status,
            "Status transition"
        );
        Ok(transition)
    }

    /// Confirms the raw object landed. Re-marking an `uploaded` upload is a
    /// no-op success; an upload already past that point is left alone and
    /// reported as skipped.
    pub async fn mark_uploaded(&self, key: &str) -> RegistryResult<Transition> {
        self.transition(
            key,
            StatusChange {
                expected: vec![UploadStatus::Pending, UploadStatus::Uploaded],
                next: UploadStatus::Uploaded,
                holder: None,
                lease: Lease::Unchanged,
            },
        )
        .await
    }

    /// Takes the processing lease for `worker`. Succeeds from `uploaded`, or
    /// from `processing` when the lease is free, already held by `worker`, or
    /// expired.
    pub async fn mark_processing(
        &self,
        key: &str,
        worker: &str,
        lease: Duration,
    ) -> RegistryResult<Transition> {
        let expires_at = OffsetDateTime::now_utc() + lease;
        self.transition(
            key,
            StatusChange {
                expected: vec![UploadStatus::Uploaded, UploadStatus::Processing],
                next: UploadStatus::Processing,
                holder: Some(worker.to_string()),
                lease: Lease::Acquire {
                    worker: worker.to_string(),
                    expires_at,
                },
            },
        )
        .await
    }

    pub async fn mark_ready(&self, key: &str, worker: &str) -> RegistryResult<Transition> {
        self.transition(
            key,
            StatusChange {
                expected: vec![UploadStatus::Processing],
                next: UploadStatus::Ready,
                holder: Some(worker.to_string()),
                lease: Lease::Release,
            },
        )
        .await
    }

    /// Drops `worker`'s lease after a failed attempt. Status stays
    /// `processing` so the redelivered message can claim it again.
    pub async fn release_claim(&self, key: &str, worker: &str) -> RegistryResult<Transition> {
        self.transition(
            key,
            StatusChange {
                expected: vec![UploadStatus::Processing],
                next: UploadStatus::Processing,
                holder: Some(worker.to_string()),
                lease: Lease::Release,
            },
        )
        .await
    }

    /// Terminal failure. Never overrides `ready`.
    pub async fn mark_failed(&self, key: &str) -> RegistryResult<Transition> {
        self.transition(
            key,
            StatusChange {
                expected: vec![
                    UploadStatus::Pending,
                    UploadStatus::Uploaded,
                    UploadStatus::Processing,
                ],
                next: UploadStatus::Failed,
                holder: None,
                lease: Lease::Release,
            },
        )
        .await
    }
}
