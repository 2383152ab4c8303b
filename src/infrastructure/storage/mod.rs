use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub mod provision;
pub mod s3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("local i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to presign request: {0}")]
    Presign(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Byte transfer and URL signing against the media bucket.
///
/// Presigned URLs let clients talk to the bucket directly; the gateway never
/// proxies those bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn presign_put(&self, key: &str) -> StorageResult<String>;

    async fn presign_get(&self, key: &str) -> StorageResult<String>;

    /// Streams the object at `key` into `dest`, creating or truncating it.
    async fn download(&self, key: &str, dest: &Path) -> StorageResult<()>;

    /// Streams `src` to `key`, overwriting any existing object.
    async fn upload(&self, key: &str, src: &Path, content_type: &str) -> StorageResult<()>;
}
