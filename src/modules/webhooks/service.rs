use std::sync::Arc;
use tracing::{error, info, warn};

use super::dto::{NotificationRecord, StorageNotification};
use crate::common::error::AppError;
use crate::infrastructure::queue::{EventPublisher, publish_json};
use crate::modules::uploads::events::{Subjects, UploadedEvent};
use crate::modules::uploads::repository::RegistryError;
use crate::modules::uploads::service::{Transition, UploadService};

/// Outcome of one notification batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub published: Vec<UploadedEvent>,
    /// Records that are not object creations.
    pub ignored: usize,
    /// Records that can never succeed (bad key, unknown upload, already
    /// advanced) and were dropped.
    pub skipped: usize,
    /// Records that hit a transient failure and may succeed on retry.
    pub failed: usize,
}

/// Translates storage notifications into `<ns>.uploaded` events. Shared by
/// the webhook route and the bus ingress consumer.
#[derive(Clone)]
pub struct IngestionService {
    uploads: UploadService,
    bus: Arc<dyn EventPublisher>,
    subjects: Subjects,
}

enum RecordOutcome {
    Published(UploadedEvent),
    Skipped,
    Failed,
}

impl IngestionService {
    pub fn new(uploads: UploadService, bus: Arc<dyn EventPublisher>, subjects: Subjects) -> Self {
        Self {
            uploads,
            bus,
            subjects,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<StorageNotification, AppError> {
        serde_json::from_slice(payload).map_err(|e| AppError::MalformedEvent(e.to_string()))
    }

    /// Processes every record; a bad record never stops its siblings.
    pub async fn ingest(&self, notification: &StorageNotification) -> IngestReport {
        let mut report = IngestReport::default();

        for record in &notification.records {
            if !record.is_object_created() {
                report.ignored += 1;
                continue;
            }

            match self.ingest_record(record).await {
                RecordOutcome::Published(event) => report.published.push(event),
                RecordOutcome::Skipped => report.skipped += 1,
                RecordOutcome::Failed => report.failed += 1,
            }
        }

        report
    }

    async fn ingest_record(&self, record: &NotificationRecord) -> RecordOutcome {
        let raw_key = &record.s3.object.key;
        let key = match record.decoded_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %raw_key, "Failed to unescape key: {}", e);
                return RecordOutcome::Skipped;
            }
        };
        info!(key = %key, bucket = %record.s3.bucket.name, "Received upload event");

        let upload = match self.uploads.mark_uploaded(&key).await {
            Ok(Transition::Applied(upload)) => upload,
            Ok(Transition::Skipped(upload)) => {
                info!(key = %key, status = %upload.status, "Upload already past uploaded, not republishing");
                return RecordOutcome::Skipped;
            }
            Err(RegistryError::NotFound(_)) => {
                warn!(key = %key, "No upload matches key");
                return RecordOutcome::Skipped;
            }
            Err(e) => {
                error!(key = %key, "Failed to update upload status: {}", e);
                return RecordOutcome::Failed;
            }
        };

        let event = UploadedEvent {
            upload_id: upload.id,
            s3_key: upload.s3_key,
        };
        let subject = self.subjects.uploaded();
        if let Err(e) = publish_json(self.bus.as_ref(), &subject, &event).await {
            error!(key = %key, subject = %subject, "Failed to publish uploaded event: {}", e);
            return RecordOutcome::Failed;
        }

        info!(key = %key, upload_id = %event.upload_id, "Published uploaded event");
        RecordOutcome::Published(event)
    }
}
