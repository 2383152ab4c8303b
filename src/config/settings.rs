use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::config::env::{self, EnvKey};

/// How storage "object created" notifications reach the pipeline.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngressMode {
    /// The object store calls `POST /webhooks/storage` on the API.
    Webhook,
    /// The object store publishes onto the event bus; the worker consumes.
    Bus,
}

impl FromStr for IngressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webhook" => Ok(IngressMode::Webhook),
            "bus" => Ok(IngressMode::Bus),
            other => Err(format!("unknown ingress mode: {}", other)),
        }
    }
}

/// `<base>-<random suffix>`. A lease held under this name is never mistaken
/// for another process's lease after a restart or on a replica started from
/// the same configuration.
pub fn instance_name(base: Option<&str>) -> String {
    let base = base.map(str::trim).filter(|b| !b.is_empty()).unwrap_or("worker");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub database_url: String,
    pub amqp_url: String,
    pub s3_endpoint: String,
    pub s3_external_endpoint: Option<String>,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub event_namespace: String,
    pub ingress_mode: IngressMode,
    pub storage_notify_arn: String,
    pub presign_ttl_secs: u64,
    /// Lease holder identity; unique per process even when replicas share
    /// `WORKER_NAME`.
    pub worker_name: String,
    pub ffmpeg_path: String,
    pub hls_segment_secs: u32,
    pub max_delivery_attempts: u32,
    pub claim_lease_secs: u64,
    pub lease_retry_secs: u64,
    pub ack_wait_secs: u64,
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            database_url: env::get(EnvKey::DatabaseUrl)?,
            amqp_url: env::get(EnvKey::AmqpUrl)?,
            s3_endpoint: env::get(EnvKey::S3Endpoint)?,
            s3_external_endpoint: env::get_opt(EnvKey::S3ExternalEndpoint),
            s3_bucket: env::get(EnvKey::S3Bucket)?,
            s3_region: env::get_or(EnvKey::S3Region, "us-east-1"),
            s3_access_key: env::get(EnvKey::S3AccessKey)?,
            s3_secret_key: env::get(EnvKey::S3SecretKey)?,
            event_namespace: env::get_or(EnvKey::EventNamespace, "reelflow"),
            ingress_mode: env::get_parsed(EnvKey::IngressMode, IngressMode::Webhook),
            storage_notify_arn: env::get_or(
                EnvKey::StorageNotifyArn,
                "arn:minio:sqs::reelflow:webhook",
            ),
            presign_ttl_secs: env::get_parsed(EnvKey::PresignTtlSecs, 900),
            worker_name: instance_name(
                env::get_opt(EnvKey::WorkerName)
                    .or_else(|| env::get_opt(EnvKey::Hostname))
                    .as_deref(),
            ),
            ffmpeg_path: env::get_or(EnvKey::FfmpegPath, "ffmpeg"),
            hls_segment_secs: env::get_parsed(EnvKey::HlsSegmentSecs, 10),
            max_delivery_attempts: env::get_parsed(EnvKey::MaxDeliveryAttempts, 5),
            claim_lease_secs: env::get_parsed(EnvKey::ClaimLeaseSecs, 120),
            lease_retry_secs: env::get_parsed(EnvKey::LeaseRetrySecs, 30),
            ack_wait_secs: env::get_parsed(EnvKey::AckWaitSecs, 3600),
        })
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn lease_retry_delay(&self) -> Duration {
        Duration::from_secs(self.lease_retry_secs)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}
