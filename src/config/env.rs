use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    AmqpUrl,
    S3Endpoint,
    S3ExternalEndpoint,
    S3Bucket,
    S3Region,
    S3AccessKey,
    S3SecretKey,
    EventNamespace,
    IngressMode,
    StorageNotifyArn,
    PresignTtlSecs,
    WorkerName,
    Hostname,
    FfmpegPath,
    HlsSegmentSecs,
    MaxDeliveryAttempts,
    ClaimLeaseSecs,
    LeaseRetrySecs,
    AckWaitSecs,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::AmqpUrl => "AMQP_URL",
            EnvKey::S3Endpoint => "S3_ENDPOINT",
            EnvKey::S3ExternalEndpoint => "S3_EXTERNAL_ENDPOINT",
            EnvKey::S3Bucket => "S3_BUCKET",
            EnvKey::S3Region => "S3_REGION",
            EnvKey::S3AccessKey => "S3_ACCESS_KEY",
            EnvKey::S3SecretKey => "S3_SECRET_KEY",
            EnvKey::EventNamespace => "EVENT_NAMESPACE",
            EnvKey::IngressMode => "INGRESS_MODE",
            EnvKey::StorageNotifyArn => "STORAGE_NOTIFY_ARN",
            EnvKey::PresignTtlSecs => "PRESIGN_TTL_SECS",
            EnvKey::WorkerName => "WORKER_NAME",
            EnvKey::Hostname => "HOSTNAME",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::HlsSegmentSecs => "HLS_SEGMENT_SECS",
            EnvKey::MaxDeliveryAttempts => "MAX_DELIVERY_ATTEMPTS",
            EnvKey::ClaimLeaseSecs => "CLAIM_LEASE_SECS",
            EnvKey::LeaseRetrySecs => "LEASE_RETRY_SECS",
            EnvKey::AckWaitSecs => "ACK_WAIT_SECS",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_opt(key: EnvKey) -> Option<String> {
    env::var(key.as_str()).ok().filter(|v| !v.is_empty())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
