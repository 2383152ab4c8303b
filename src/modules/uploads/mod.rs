use axum::Router;
use axum::routing::get;

use crate::state::AppState;

pub mod dto;
pub mod events;
pub mod handler;
pub mod keys;
pub mod model;
pub mod repository;
pub mod service;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/uploads",
            get(handler::list_uploads).post(handler::create_upload),
        )
        .route("/uploads/{id}", get(handler::get_upload))
        .route("/assets", get(handler::list_assets))
        .route("/assets/{id}", get(handler::get_asset))
}
