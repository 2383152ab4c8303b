use axum::Router;
use axum::routing::get;

use crate::state::AppState;

pub mod handler;
pub mod hub;
pub mod relay;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(handler::live_updates))
}
