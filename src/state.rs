use std::sync::Arc;

use crate::infrastructure::storage::ObjectStore;
use crate::modules::live::hub::EventHub;
use crate::modules::uploads::service::UploadService;
use crate::modules::webhooks::service::IngestionService;

#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub storage: Arc<dyn ObjectStore>,
    pub ingestion: IngestionService,
    pub hub: EventHub,
}

impl AppState {
    pub fn new(
        uploads: UploadService,
        storage: Arc<dyn ObjectStore>,
        ingestion: IngestionService,
        hub: EventHub,
    ) -> Self {
        Self {
            uploads,
            storage,
            ingestion,
            hub,
        }
    }
}
