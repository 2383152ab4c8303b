use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tracing::{debug, info, warn};

use super::hub::LiveFrame;
use crate::state::AppState;

/// Live processing updates
/// Upgrades to a websocket that receives a `{type, data}` JSON frame for
/// every asset this deployment finishes processing.
#[utoipa::path(
    get,
    path = "/ws",
    responses(
        (status = 101, description = "Switched to websocket"),
        (status = 400, description = "Not a websocket handshake")
    ),
    tag = "Live"
)]
pub async fn live_updates(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let frames = state.hub.subscribe();
    ws.on_upgrade(move |socket| forward_frames(socket, frames))
}

async fn forward_frames(socket: WebSocket, mut frames: Receiver<LiveFrame>) {
    let (mut sink, mut incoming) = socket.split();
    info!("🔌 Live client connected");

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(kind = %frame.kind, "Failed to encode live frame: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Live client fell behind, frames dropped"),
                Err(RecvError::Closed) => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => debug!("Ignoring message from live client"),
            },
        }
    }

    info!("Live client disconnected");
}
