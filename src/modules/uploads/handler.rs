use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;
use validator::Validate;

use super::dto::{AssetResponse, CreateUploadRequest, CreateUploadResponse};
use super::model::{Asset, Upload};
use crate::common::error::AppError;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;

/// Request an upload slot
/// Returns a presigned PUT URL; the client uploads the file straight to the bucket.
#[utoipa::path(
    post,
    path = "/api/v1/uploads",
    request_body = CreateUploadRequest,
    responses(
        (status = 201, description = "Upload slot created", body = ApiResponse<CreateUploadResponse>),
        (status = 400, description = "Bad Request"),
        (status = 503, description = "Registry or storage unavailable")
    ),
    tag = "Uploads"
)]
pub async fn create_upload(
    State(state): State<AppState>,
    Json(payload): Json<CreateUploadRequest>,
) -> impl IntoResponse {
    if let Err(e) = payload.validate() {
        return ApiError(e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }

    let title = payload.title.as_deref().unwrap_or(payload.filename.as_str());

    match state.uploads.create(title, &payload.filename).await {
        Ok((upload, upload_url)) => ApiSuccess::created(
            CreateUploadResponse {
                id: upload.id,
                upload_url,
                key: upload.s3_key,
            },
            "Upload slot created",
        )
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// List uploads
#[utoipa::path(
    get,
    path = "/api/v1/uploads",
    responses(
        (status = 200, description = "List of uploads", body = ApiResponse<Vec<Upload>>)
    ),
    tag = "Uploads"
)]
pub async fn list_uploads(State(state): State<AppState>) -> impl IntoResponse {
    match state.uploads.list().await {
        Ok(uploads) => ApiSuccess::ok(uploads, "Uploads retrieved successfully").into_response(),
        Err(e) => e.into_response(),
    }
}

/// Get upload by ID
#[utoipa::path(
    get,
    path = "/api/v1/uploads/{id}",
    params(
        ("id" = Uuid, Path, description = "Upload ID")
    ),
    responses(
        (status = 200, description = "Upload details", body = ApiResponse<Upload>),
        (status = 404, description = "Upload not found")
    ),
    tag = "Uploads"
)]
pub async fn get_upload(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.uploads.get(id).await {
        Ok(upload) => ApiSuccess::ok(upload, "Upload retrieved successfully").into_response(),
        Err(e) => e.into_response(),
    }
}

/// List assets
#[utoipa::path(
    get,
    path = "/api/v1/assets",
    responses(
        (status = 200, description = "List of transcoded assets", body = ApiResponse<Vec<Asset>>)
    ),
    tag = "Assets"
)]
pub async fn list_assets(State(state): State<AppState>) -> impl IntoResponse {
    match state.uploads.registry().list_assets().await {
        Ok(assets) => ApiSuccess::ok(assets, "Assets retrieved successfully").into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

/// Get asset by ID
/// Includes a presigned URL for the master playlist.
#[utoipa::path(
    get,
    path = "/api/v1/assets/{id}",
    params(
        ("id" = Uuid, Path, description = "Asset ID")
    ),
    responses(
        (status = 200, description = "Asset details", body = ApiResponse<AssetResponse>),
        (status = 404, description = "Asset not found")
    ),
    tag = "Assets"
)]
pub async fn get_asset(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let asset = match state.uploads.registry().get_asset(id).await {
        Ok(Some(asset)) => asset,
        Ok(None) => return AppError::NotFound(format!("asset {}", id)).into_response(),
        Err(e) => return AppError::from(e).into_response(),
    };

    match state.storage.presign_get(&asset.hls_root).await {
        Ok(playback_url) => ApiSuccess::ok(
            AssetResponse {
                asset,
                playback_url,
            },
            "Asset retrieved successfully",
        )
        .into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}
