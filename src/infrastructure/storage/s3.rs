use async_trait::async_trait;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    Event, FilterRule, FilterRuleName, NotificationConfiguration,
    NotificationConfigurationFilter, QueueConfiguration, S3KeyFilter,
};
use aws_sdk_s3::{Client, config::BehaviorVersion, config::Credentials, config::Region};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ObjectStore, StorageError, StorageResult};
use crate::config::settings::AppConfig;

/// S3-compatible bucket gateway (MinIO in development).
#[derive(Clone)]
pub struct StorageService {
    pub client: Client,
    presign_client: Client,
    pub bucket: String,
    presign_ttl: Duration,
}

fn build_client(endpoint: &str, region: &str, access_key: &str, secret_key: &str) -> Client {
    let credentials = Credentials::new(access_key, secret_key, None, None, "static");

    let config = Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .endpoint_url(endpoint)
        .credentials_provider(credentials)
        .force_path_style(true) // Required for MinIO
        .build();

    Client::from_conf(config)
}

impl StorageService {
    pub fn new(config: &AppConfig) -> Self {
        let client = build_client(
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        );

        // Signatures cover the host, so URLs handed to browsers must be signed
        // against the endpoint they will actually reach.
        let presign_client = match &config.s3_external_endpoint {
            Some(external) => build_client(
                external,
                &config.s3_region,
                &config.s3_access_key,
                &config.s3_secret_key,
            ),
            None => client.clone(),
        };

        info!(endpoint = %config.s3_endpoint, bucket = %config.s3_bucket, "✅ S3 client ready");

        Self {
            client,
            presign_client,
            bucket: config.s3_bucket.clone(),
            presign_ttl: config.presign_ttl(),
        }
    }

    fn presigning_config(&self) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(self.presign_ttl)
            .map_err(|e| StorageError::Presign(e.to_string()))
    }

    pub async fn ensure_bucket_exists(&self) -> StorageResult<()> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            debug!(bucket = %self.bucket, "bucket already exists");
            return Ok(());
        }

        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("failed to create bucket: {}", DisplayErrorContext(&e))))?;

        info!(bucket = %self.bucket, "Created bucket");
        Ok(())
    }

    /// Points "object created" notifications under `key_prefix` at `target_arn`.
    /// Overwrites whatever notification configuration the bucket had.
    pub async fn ensure_notification_configured(
        &self,
        target_arn: &str,
        event_types: &[&str],
        key_prefix: &str,
    ) -> StorageResult<()> {
        let filter = NotificationConfigurationFilter::builder()
            .key(
                S3KeyFilter::builder()
                    .filter_rules(
                        FilterRule::builder()
                            .name(FilterRuleName::Prefix)
                            .value(key_prefix)
                            .build(),
                    )
                    .build(),
            )
            .build();

        let queue = QueueConfiguration::builder()
            .queue_arn(target_arn)
            .set_events(Some(event_types.iter().map(|e| Event::from(*e)).collect()))
            .filter(filter)
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        self.client
            .put_bucket_notification_configuration()
            .bucket(&self.bucket)
            .notification_configuration(
                NotificationConfiguration::builder()
                    .queue_configurations(queue)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!(
                    "failed to set bucket notification: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    /// Grants anonymous `GetObject` on `path_prefix`, so players can fetch
    /// playlists and segments without signing every request.
    pub async fn ensure_public_read_policy(&self, path_prefix: &str) -> StorageResult<()> {
        let policy = public_read_policy(&self.bucket, path_prefix);

        self.client
            .put_bucket_policy()
            .bucket(&self.bucket)
            .policy(policy)
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!("failed to set bucket policy: {}", DisplayErrorContext(&e)))
            })?;

        Ok(())
    }
}

fn public_read_policy(bucket: &str, path_prefix: &str) -> String {
    let prefix = path_prefix.trim_end_matches('/');
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": { "AWS": ["*"] },
                "Action": ["s3:GetObject"],
                "Resource": [format!("arn:aws:s3:::{}/{}/*", bucket, prefix)]
            }
        ]
    })
    .to_string()
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn presign_put(&self, key: &str) -> StorageResult<String> {
        let request = self
            .presign_client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning_config()?)
            .await
            .map_err(|e| StorageError::Presign(DisplayErrorContext(&e).to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn presign_get(&self, key: &str) -> StorageResult<String> {
        let request = self
            .presign_client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning_config()?)
            .await
            .map_err(|e| StorageError::Presign(DisplayErrorContext(&e).to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn download(&self, key: &str, dest: &Path) -> StorageResult<()> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Transfer(format!(
                        "failed to download {}: {}",
                        key,
                        DisplayErrorContext(&service_err)
                    ))
                }
            })?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut reader = resp.body.into_async_read();
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StorageError::Transfer(format!("failed to write {}: {}", key, e)))?;
        file.flush().await?;

        debug!(key, bytes = written, "Downloaded object");
        Ok(())
    }

    async fn upload(&self, key: &str, src: &Path, content_type: &str) -> StorageResult<()> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| StorageError::Transfer(format!("failed to open {}: {}", src.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                StorageError::Transfer(format!("failed to upload {}: {}", key, DisplayErrorContext(&e)))
            })?;

        debug!(key, content_type, "Uploaded object");
        Ok(())
    }
}
