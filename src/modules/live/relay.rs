use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::hub::{EventHub, LiveFrame};
use crate::infrastructure::queue::{BusMessage, MessageHandler};
use crate::modules::uploads::events::AssetProcessedEvent;

/// Feeds `<ns>.assets.processed` into this process's [`EventHub`].
#[derive(Clone)]
pub struct AssetEventRelay {
    hub: EventHub,
}

impl AssetEventRelay {
    pub fn new(hub: EventHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl MessageHandler for AssetEventRelay {
    async fn handle(&self, message: BusMessage) {
        let subject = message.subject.clone();

        match serde_json::from_slice::<AssetProcessedEvent>(&message.payload)
            .and_then(|event| LiveFrame::asset_processed(&event))
        {
            Ok(frame) => {
                let clients = self.hub.publish(frame);
                debug!(subject = %subject, clients, "Relayed processed event");
            }
            Err(e) => warn!(subject = %subject, "Dropping undecodable processed event: {}", e),
        }

        // Live frames are fire-and-forget; nothing is gained by redelivery.
        if let Err(e) = message.ack().await {
            error!(subject = %subject, "Failed to ack message: {}", e);
        }
    }
}
