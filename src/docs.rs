use utoipa::OpenApi;

use crate::modules::uploads::dto::*;
use crate::modules::uploads::model::{Asset, AssetStatus, Upload, UploadStatus};
use crate::modules::webhooks::handler::WebhookAck;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::uploads::handler::create_upload,
        crate::modules::uploads::handler::list_uploads,
        crate::modules::uploads::handler::get_upload,
        crate::modules::uploads::handler::list_assets,
        crate::modules::uploads::handler::get_asset,
        crate::modules::webhooks::handler::storage_notification,
        crate::modules::live::handler::live_updates,
    ),
    components(
        schemas(
            CreateUploadRequest, CreateUploadResponse, AssetResponse,
            Upload, UploadStatus, Asset, AssetStatus,
            WebhookAck,
        )
    ),
    tags(
        (name = "Uploads", description = "Upload registration and status"),
        (name = "Assets", description = "Processed streaming assets"),
        (name = "Webhooks", description = "Object store notifications"),
        (name = "Live", description = "Websocket feed of processed assets")
    )
)]
pub struct ApiDoc;
