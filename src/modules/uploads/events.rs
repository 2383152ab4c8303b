use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::AssetStatus;

/// Subject names under one event namespace.
#[derive(Debug, Clone)]
pub struct Subjects {
    namespace: String,
}

impl Subjects {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_end_matches('.').to_string(),
        }
    }

    /// Stream name for everything under the namespace.
    pub fn stream(&self) -> String {
        self.namespace.to_uppercase().replace(['.', '-'], "_")
    }

    /// Pattern the namespace stream is provisioned with.
    pub fn stream_pattern(&self) -> String {
        format!("{}.>", self.namespace)
    }

    pub fn uploaded(&self) -> String {
        format!("{}.uploaded", self.namespace)
    }

    pub fn asset_processed(&self) -> String {
        format!("{}.assets.processed", self.namespace)
    }

    /// Native storage notifications, when the bucket publishes to the bus.
    pub fn storage_events(&self) -> String {
        format!("{}.storage.events", self.namespace)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}.uploads.dead", self.namespace)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedEvent {
    pub upload_id: Uuid,
    pub s3_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetProcessedEvent {
    pub asset_id: Uuid,
    pub upload_id: Uuid,
    pub status: AssetStatus,
}

/// Event payload parked on the dead-letter subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub subject: String,
    pub reason: String,
    pub delivery_attempt: u32,
    pub payload: String,
}
