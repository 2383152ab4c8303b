use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{Asset, AssetStatus, NewAsset, NewUpload, Upload, UploadStatus};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RegistryError::Conflict(db.message().to_string())
            }
            _ => RegistryError::Unavailable(e.to_string()),
        }
    }
}

/// What a status change does to the processing lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lease {
    Unchanged,
    Acquire { worker: String, expires_at: OffsetDateTime },
    Release,
}

/// A conditional status transition. It applies only when the current status
/// is one of `expected` and, if `holder` is set, that worker may hold the
/// lease (free, already theirs, or expired).
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub expected: Vec<UploadStatus>,
    pub next: UploadStatus,
    pub holder: Option<String>,
    pub lease: Lease,
}

impl StatusChange {
    pub fn permits(&self, upload: &Upload, now: OffsetDateTime) -> bool {
        self.expected.contains(&upload.status)
            && self
                .holder
                .as_deref()
                .is_none_or(|worker| upload.claimable_by(worker, now))
    }

    /// Column values the lease ends up with, or `None` to leave them alone.
    pub fn lease_columns(&self) -> Option<(Option<String>, Option<OffsetDateTime>)> {
        match &self.lease {
            Lease::Unchanged => None,
            Lease::Acquire { worker, expires_at } => Some((Some(worker.clone()), Some(*expires_at))),
            Lease::Release => Some((None, None)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Applied(Upload),
    /// The row exists but the precondition did not hold; carries the row as
    /// it currently is.
    Rejected(Upload),
}

/// Query interface over the relational store. Each operation is one atomic
/// statement; nothing spans a transaction across calls.
#[async_trait]
pub trait UploadRegistry: Send + Sync {
    async fn create(&self, upload: NewUpload) -> RegistryResult<Upload>;

    async fn get_by_id(&self, id: Uuid) -> RegistryResult<Option<Upload>>;

    async fn list_all(&self) -> RegistryResult<Vec<Upload>>;

    async fn find_by_key(&self, s3_key: &str) -> RegistryResult<Option<Upload>>;

    /// Fails with [`RegistryError::NotFound`] when no upload has `s3_key`.
    async fn update_status_by_key(
        &self,
        s3_key: &str,
        change: &StatusChange,
    ) -> RegistryResult<StatusUpdate>;

    /// Fails with [`RegistryError::Conflict`] if the upload already has an asset.
    async fn create_asset(&self, asset: NewAsset) -> RegistryResult<Asset>;

    async fn get_asset(&self, id: Uuid) -> RegistryResult<Option<Asset>>;

    async fn list_assets(&self) -> RegistryResult<Vec<Asset>>;

    async fn find_asset_by_upload(&self, upload_id: Uuid) -> RegistryResult<Option<Asset>>;
}

#[derive(Debug, FromRow)]
struct UploadRow {
    id: Uuid,
    title: String,
    s3_key: String,
    status: String,
    claimed_by: Option<String>,
    claim_expires_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<UploadRow> for Upload {
    type Error = RegistryError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        Ok(Upload {
            id: row.id,
            title: row.title,
            s3_key: row.s3_key,
            status: row.status.parse().map_err(RegistryError::Unavailable)?,
            claimed_by: row.claimed_by,
            claim_expires_at: row.claim_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AssetRow {
    id: Uuid,
    upload_id: Uuid,
    hls_root: String,
    status: String,
    created_at: OffsetDateTime,
}

impl TryFrom<AssetRow> for Asset {
    type Error = RegistryError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        Ok(Asset {
            id: row.id,
            upload_id: row.upload_id,
            hls_root: row.hls_root,
            status: row.status.parse().map_err(RegistryError::Unavailable)?,
            created_at: row.created_at,
        })
    }
}

const UPLOAD_COLUMNS: &str =
    "id, title, s3_key, status, claimed_by, claim_expires_at, created_at, updated_at";
const ASSET_COLUMNS: &str = "id, upload_id, hls_root, status, created_at";

#[derive(Clone)]
pub struct PgUploadRegistry {
    pool: PgPool,
}

impl PgUploadRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_uploads(rows: Vec<UploadRow>) -> RegistryResult<Vec<Upload>> {
    rows.into_iter().map(Upload::try_from).collect()
}

#[async_trait]
impl UploadRegistry for PgUploadRegistry {
    async fn create(&self, upload: NewUpload) -> RegistryResult<Upload> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            r#"
            INSERT INTO uploads (id, title, s3_key, status)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        ))
        .bind(upload.id)
        .bind(&upload.title)
        .bind(&upload.s3_key)
        .bind(UploadStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_by_id(&self, id: Uuid) -> RegistryResult<Option<Upload>> {
        sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {} FROM uploads WHERE id = $1",
            UPLOAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Upload::try_from)
        .transpose()
    }

    async fn list_all(&self) -> RegistryResult<Vec<Upload>> {
        let rows = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {} FROM uploads ORDER BY created_at DESC",
            UPLOAD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        into_uploads(rows)
    }

    async fn find_by_key(&self, s3_key: &str) -> RegistryResult<Option<Upload>> {
        sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {} FROM uploads WHERE s3_key = $1",
            UPLOAD_COLUMNS
        ))
        .bind(s3_key)
        .fetch_optional(&self.pool)
        .await?
        .map(Upload::try_from)
        .transpose()
    }

    async fn update_status_by_key(
        &self,
        s3_key: &str,
        change: &StatusChange,
    ) -> RegistryResult<StatusUpdate> {
        let expected: Vec<String> = change.expected.iter().map(|s| s.as_str().to_string()).collect();
        let lease = change.lease_columns();
        let (claimed_by, claim_expires_at) = lease.clone().unwrap_or((None, None));

        let applied = sqlx::query_as::<_, UploadRow>(&format!(
            r#"
            UPDATE uploads
            SET status = $2,
                claimed_by = CASE WHEN $4 THEN $5 ELSE claimed_by END,
                claim_expires_at = CASE WHEN $4 THEN $6 ELSE claim_expires_at END,
                updated_at = NOW()
            WHERE s3_key = $1
              AND status = ANY($3)
              AND ($7::text IS NULL
                   OR claimed_by IS NULL
                   OR claimed_by = $7
                   OR claim_expires_at <= NOW())
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        ))
        .bind(s3_key)
        .bind(change.next.as_str())
        .bind(&expected)
        .bind(lease.is_some())
        .bind(claimed_by)
        .bind(claim_expires_at)
        .bind(change.holder.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = applied {
            return Ok(StatusUpdate::Applied(row.try_into()?));
        }

        match self.find_by_key(s3_key).await? {
            Some(current) => Ok(StatusUpdate::Rejected(current)),
            None => Err(RegistryError::NotFound(format!("upload {}", s3_key))),
        }
    }

    async fn create_asset(&self, asset: NewAsset) -> RegistryResult<Asset> {
        let row = sqlx::query_as::<_, AssetRow>(&format!(
            r#"
            INSERT INTO assets (id, upload_id, hls_root, status)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            ASSET_COLUMNS
        ))
        .bind(asset.id)
        .bind(asset.upload_id)
        .bind(&asset.hls_root)
        .bind(AssetStatus::Ready.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_asset(&self, id: Uuid) -> RegistryResult<Option<Asset>> {
        sqlx::query_as::<_, AssetRow>(&format!("SELECT {} FROM assets WHERE id = $1", ASSET_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Asset::try_from)
            .transpose()
    }

    async fn list_assets(&self) -> RegistryResult<Vec<Asset>> {
        sqlx::query_as::<_, AssetRow>(&format!(
            "SELECT {} FROM assets ORDER BY created_at DESC",
            ASSET_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Asset::try_from)
        .collect()
    }

    async fn find_asset_by_upload(&self, upload_id: Uuid) -> RegistryResult<Option<Asset>> {
        sqlx::query_as::<_, AssetRow>(&format!(
            "SELECT {} FROM assets WHERE upload_id = $1",
            ASSET_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Asset::try_from)
        .transpose()
    }
}
