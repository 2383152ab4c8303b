#![allow(dead_code)]

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use reelflow::infrastructure::queue::{Acknowledger, BusError, BusMessage, BusResult, EventPublisher};
use reelflow::infrastructure::storage::{ObjectStore, StorageError, StorageResult};
use reelflow::modules::live::hub::EventHub;
use reelflow::modules::uploads::events::Subjects;
use reelflow::modules::uploads::model::{Asset, AssetStatus, NewAsset, NewUpload, Upload, UploadStatus};
use reelflow::modules::uploads::repository::{
    RegistryError, RegistryResult, StatusChange, StatusUpdate, UploadRegistry,
};
use reelflow::modules::uploads::service::UploadService;
use reelflow::modules::webhooks::service::IngestionService;
use reelflow::state::AppState;
use reelflow::workers::encoder::{EncodeError, Encoder, VariantSpec};
use reelflow::workers::transcoder::{TranscodeWorker, TranscoderSettings};

pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct RegistryInner {
    uploads: Vec<Upload>,
    assets: Vec<Asset>,
    history: Vec<(String, UploadStatus)>,
}

/// Registry applying the same conditional-update rules as the SQL one.
#[derive(Default)]
pub struct InMemoryRegistry {
    inner: Mutex<RegistryInner>,
}

impl InMemoryRegistry {
    pub fn status_of(&self, key: &str) -> Option<UploadStatus> {
        let inner = self.inner.lock().unwrap();
        inner.uploads.iter().find(|u| u.s3_key == key).map(|u| u.status)
    }

    pub fn upload(&self, key: &str) -> Option<Upload> {
        let inner = self.inner.lock().unwrap();
        inner.uploads.iter().find(|u| u.s3_key == key).cloned()
    }

    /// Every applied status change for `key`, in order.
    pub fn history(&self, key: &str) -> Vec<UploadStatus> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.inner.lock().unwrap().assets.clone()
    }

    /// Overwrites status and lease directly, bypassing transition rules.
    pub fn force(&self, key: &str, status: UploadStatus, claimed_by: Option<&str>, lease: Option<time::Duration>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(upload) = inner.uploads.iter_mut().find(|u| u.s3_key == key) {
            upload.status = status;
            upload.claimed_by = claimed_by.map(String::from);
            upload.claim_expires_at = lease.map(|l| OffsetDateTime::now_utc() + l);
        }
    }
}

#[async_trait]
impl UploadRegistry for InMemoryRegistry {
    async fn create(&self, upload: NewUpload) -> RegistryResult<Upload> {
        let mut inner = self.inner.lock().unwrap();
        if inner.uploads.iter().any(|u| u.s3_key == upload.s3_key) {
            return Err(RegistryError::Conflict(upload.s3_key));
        }
        let now = OffsetDateTime::now_utc();
        let created = Upload {
            id: upload.id,
            title: upload.title,
            s3_key: upload.s3_key,
            status: UploadStatus::Pending,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.uploads.push(created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: Uuid) -> RegistryResult<Option<Upload>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.uploads.iter().find(|u| u.id == id).cloned())
    }

    async fn list_all(&self) -> RegistryResult<Vec<Upload>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.uploads.iter().rev().cloned().collect())
    }

    async fn find_by_key(&self, s3_key: &str) -> RegistryResult<Option<Upload>> {
        Ok(self.upload(s3_key))
    }

    async fn update_status_by_key(&self, s3_key: &str, change: &StatusChange) -> RegistryResult<StatusUpdate> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let now = OffsetDateTime::now_utc();

        let upload = inner
            .uploads
            .iter_mut()
            .find(|u| u.s3_key == s3_key)
            .ok_or_else(|| RegistryError::NotFound(format!("upload {}", s3_key)))?;

        if !change.permits(upload, now) {
            return Ok(StatusUpdate::Rejected(upload.clone()));
        }

        upload.status = change.next;
        if let Some((claimed_by, expires_at)) = change.lease_columns() {
            upload.claimed_by = claimed_by;
            upload.claim_expires_at = expires_at;
        }
        upload.updated_at = now;
        inner.history.push((s3_key.to_string(), change.next));
        Ok(StatusUpdate::Applied(upload.clone()))
    }

    async fn create_asset(&self, asset: NewAsset) -> RegistryResult<Asset> {
        let mut inner = self.inner.lock().unwrap();
        if inner.assets.iter().any(|a| a.upload_id == asset.upload_id) {
            return Err(RegistryError::Conflict(format!("asset for {}", asset.upload_id)));
        }
        let created = Asset {
            id: asset.id,
            upload_id: asset.upload_id,
            hls_root: asset.hls_root,
            status: AssetStatus::Ready,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.assets.push(created.clone());
        Ok(created)
    }

    async fn get_asset(&self, id: Uuid) -> RegistryResult<Option<Asset>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.assets.iter().find(|a| a.id == id).cloned())
    }

    async fn list_assets(&self) -> RegistryResult<Vec<Asset>> {
        Ok(self.assets())
    }

    async fn find_asset_by_upload(&self, upload_id: Uuid) -> RegistryResult<Option<Asset>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.assets.iter().find(|a| a.upload_id == upload_id).cloned())
    }
}

/// Bucket held in memory: key -> (bytes, content type).
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryStore {
    pub fn put(&self, key: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes.to_vec(), "video/mp4".to_string()));
    }

    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().unwrap().get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn presign_put(&self, key: &str) -> StorageResult<String> {
        Ok(format!("http://storage.test/media/{}?X-Amz-Signature=put", key))
    }

    async fn presign_get(&self, key: &str) -> StorageResult<String> {
        Ok(format!("http://storage.test/media/{}?X-Amz-Signature=get", key))
    }

    async fn download(&self, key: &str, dest: &Path) -> StorageResult<()> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn upload(&self, key: &str, src: &Path, content_type: &str) -> StorageResult<()> {
        let bytes = tokio::fs::read(src).await?;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }
}

/// Records every confirmed publish; can be switched to refuse publishes.
#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingBus {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published<T: DeserializeOwned>(&self, subject: &str) -> Vec<T> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, p)| serde_json::from_slice(p).unwrap())
            .collect()
    }

    pub fn count(&self, subject: &str) -> usize {
        self.published.lock().unwrap().iter().filter(|(s, _)| s == subject).count()
    }
}

#[async_trait]
impl EventPublisher for RecordingBus {
    async fn publish(&self, subject: &str, payload: &[u8]) -> BusResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "broker unreachable".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Writes a minimal HLS tree instead of running ffmpeg.
#[derive(Default)]
pub struct FakeEncoder {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeEncoder {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(&self, input: &Path, output_dir: &Path, variants: &[VariantSpec]) -> Result<(), EncodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EncodeError::Exit {
                code: Some(1),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }
        if !tokio::fs::try_exists(input).await? {
            return Err(EncodeError::MissingOutput(input.to_path_buf()));
        }

        tokio::fs::create_dir_all(output_dir).await?;
        tokio::fs::write(output_dir.join("master.m3u8"), b"#EXTM3U\n").await?;
        for i in 0..variants.len() {
            tokio::fs::write(output_dir.join(format!("v{}.m3u8", i)), b"#EXTM3U\n").await?;
            tokio::fs::write(output_dir.join(format!("v{}_segment000.ts", i)), b"ts").await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nak,
}

#[derive(Clone, Default)]
pub struct Settlements(Arc<Mutex<Vec<Settlement>>>);

impl Settlements {
    pub fn all(&self) -> Vec<Settlement> {
        self.0.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Settlement> {
        self.0.lock().unwrap().last().copied()
    }
}

struct RecordingAcker(Settlements);

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> BusResult<()> {
        self.0.0.lock().unwrap().push(Settlement::Ack);
        Ok(())
    }

    async fn nak(&self) -> BusResult<()> {
        self.0.0.lock().unwrap().push(Settlement::Nak);
        Ok(())
    }
}

pub fn message(subject: &str, payload: &[u8], attempt: u32, settlements: &Settlements) -> BusMessage {
    BusMessage::new(
        subject,
        payload.to_vec(),
        attempt,
        Box::new(RecordingAcker(settlements.clone())),
    )
}

/// Every service wired against in-memory fakes.
pub struct Harness {
    pub registry: Arc<InMemoryRegistry>,
    pub store: Arc<InMemoryStore>,
    pub bus: Arc<RecordingBus>,
    pub encoder: Arc<FakeEncoder>,
    pub subjects: Subjects,
    pub uploads: UploadService,
    pub hub: EventHub,
}

impl Harness {
    pub fn new() -> Self {
        let registry = Arc::new(InMemoryRegistry::default());
        let store = Arc::new(InMemoryStore::default());
        let uploads = UploadService::new(registry.clone(), store.clone());
        Self {
            registry,
            store,
            bus: Arc::new(RecordingBus::default()),
            encoder: Arc::new(FakeEncoder::default()),
            subjects: Subjects::new("reelflow"),
            uploads,
            hub: EventHub::default(),
        }
    }

    pub fn ingestion(&self) -> IngestionService {
        IngestionService::new(self.uploads.clone(), self.bus.clone(), self.subjects.clone())
    }

    pub fn worker(&self, name: &str) -> TranscodeWorker {
        TranscodeWorker::new(
            self.uploads.clone(),
            self.store.clone(),
            self.bus.clone(),
            self.encoder.clone(),
            self.subjects.clone(),
            TranscoderSettings {
                worker_name: name.to_string(),
                claim_lease: Duration::from_secs(3600),
                lease_retry_delay: Duration::ZERO,
                max_delivery_attempts: MAX_ATTEMPTS,
                variants: VariantSpec::default_ladder(),
            },
        )
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.uploads.clone(),
            self.store.clone(),
            self.ingestion(),
            self.hub.clone(),
        )
    }

    /// A created upload whose raw object is already in the bucket.
    pub async fn uploaded_object(&self, filename: &str) -> Upload {
        let (upload, _) = self.uploads.create(filename, filename).await.unwrap();
        self.store.put(&upload.s3_key, b"raw video bytes");
        upload
    }
}
