use axum::{body::Bytes, extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

use super::service::IngestionService;
use crate::common::response::{ApiResponse, ApiSuccess};
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub published: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Storage notification webhook
/// Called by the object store when objects are created. Answers 200 whenever
/// the payload decodes, so one bad record never makes the store retry the
/// whole batch.
#[utoipa::path(
    post,
    path = "/webhooks/storage",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Notification accepted", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Undecodable notification")
    ),
    tag = "Webhooks"
)]
pub async fn storage_notification(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let notification = match IngestionService::decode(&body) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("Failed to decode webhook event: {}", e);
            return e.into_response();
        }
    };

    let report = state.ingestion.ingest(&notification).await;

    ApiSuccess::ok(
        WebhookAck {
            published: report.published.len(),
            ignored: report.ignored,
            skipped: report.skipped,
            failed: report.failed,
        },
        "Notification processed",
    )
    .into_response()
}
