use async_trait::async_trait;
use tracing::{error, warn};

use crate::infrastructure::queue::{BusMessage, MessageHandler};
use crate::modules::webhooks::service::IngestionService;

/// Bus ingress: storage notifications arrive on `<ns>.storage.events`
/// instead of the webhook route and go through the same ingestion routine.
#[derive(Clone)]
pub struct NotificationConsumer {
    ingestion: IngestionService,
}

impl NotificationConsumer {
    pub fn new(ingestion: IngestionService) -> Self {
        Self { ingestion }
    }
}

#[async_trait]
impl MessageHandler for NotificationConsumer {
    async fn handle(&self, message: BusMessage) {
        let subject = message.subject.clone();

        let notification = match IngestionService::decode(&message.payload) {
            Ok(notification) => notification,
            Err(e) => {
                // Redelivery cannot fix the payload.
                warn!(subject = %subject, "Dropping undecodable storage notification: {}", e);
                if let Err(e) = message.ack().await {
                    error!(subject = %subject, "Failed to ack message: {}", e);
                }
                return;
            }
        };

        let report = self.ingestion.ingest(&notification).await;
        let result = if report.failed > 0 {
            warn!(
                subject = %subject,
                failed = report.failed,
                attempt = message.delivery_attempt,
                "Storage notification partly failed, requesting redelivery"
            );
            message.nak().await
        } else {
            message.ack().await
        };

        if let Err(e) = result {
            error!(subject = %subject, "Failed to settle message: {}", e);
        }
    }
}
