use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::model::Asset;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateUploadRequest {
    #[validate(length(min = 1, max = 255, message = "filename is required"))]
    pub filename: String,
    /// Display title; defaults to the filename.
    #[validate(length(max = 255))]
    pub title: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateUploadResponse {
    pub id: Uuid,
    pub upload_url: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AssetResponse {
    pub asset: Asset,
    /// Presigned GET URL for the master playlist.
    pub playback_url: String,
}
