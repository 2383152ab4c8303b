use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::modules::uploads::events::AssetProcessedEvent;

/// Frames kept for a slow client before it starts missing some.
pub const LIVE_BUFFER: usize = 100;

/// What a dashboard client receives: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl LiveFrame {
    pub fn asset_processed(event: &AssetProcessedEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: "asset_processed".to_string(),
            data: serde_json::to_value(event)?,
        })
    }
}

/// Fan-out of live frames to every connected websocket client of this
/// process.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<LiveFrame>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(LIVE_BUFFER)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many clients the frame reached; zero when nobody listens.
    pub fn publish(&self, frame: LiveFrame) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveFrame> {
        self.sender.subscribe()
    }

    pub fn clients(&self) -> usize {
        self.sender.receiver_count()
    }
}
