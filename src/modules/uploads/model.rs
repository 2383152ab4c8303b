use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Processing,
    Ready,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Processing => "processing",
            UploadStatus::Ready => "ready",
            UploadStatus::Failed => "failed",
        }
    }

    /// Statuses past the point where a storage notification means anything.
    pub fn is_past_upload(&self) -> bool {
        matches!(
            self,
            UploadStatus::Processing | UploadStatus::Ready | UploadStatus::Failed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Ready | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploaded" => Ok(UploadStatus::Uploaded),
            "processing" => Ok(UploadStatus::Processing),
            "ready" => Ok(UploadStatus::Ready),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(format!("unknown upload status: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Ready,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Ready => "ready",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(AssetStatus::Ready),
            other => Err(format!("unknown asset status: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct Upload {
    pub id: Uuid,
    pub title: String,
    pub s3_key: String,
    pub status: UploadStatus,
    /// Worker currently holding the processing lease.
    pub claimed_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub claim_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl Upload {
    /// Whether `worker` may take the processing lease at `now`.
    pub fn claimable_by(&self, worker: &str, now: OffsetDateTime) -> bool {
        match (&self.claimed_by, self.claim_expires_at) {
            (None, _) => true,
            (Some(owner), _) if owner == worker => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct Asset {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub hls_root: String,
    pub status: AssetStatus,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub id: Uuid,
    pub title: String,
    pub s3_key: String,
}

#[derive(Debug, Clone)]
pub struct NewAsset {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub hls_root: String,
}
