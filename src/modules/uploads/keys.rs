//! Storage key layout.
//!
//! Raw uploads live at `original/<uploadId><.ext>`; transcoded output lives
//! under `hls/<assetId>/`.

use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub const RAW_PREFIX: &str = "original";
pub const STREAMING_PREFIX: &str = "hls";
pub const MASTER_PLAYLIST: &str = "master.m3u8";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key format: {0}")]
    Format(String),

    #[error("key {0} does not name an upload id")]
    UploadId(String),
}

pub fn raw_key(upload_id: Uuid, filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    format!("{}/{}{}", RAW_PREFIX, upload_id, ext)
}

/// Recovers the upload id from a raw key: exactly `namespace/filename`, with
/// the filename stem being the id.
pub fn parse_upload_id(key: &str) -> Result<Uuid, KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    let [namespace, filename] = parts.as_slice() else {
        return Err(KeyError::Format(key.to_string()));
    };
    if namespace.is_empty() || filename.is_empty() {
        return Err(KeyError::Format(key.to_string()));
    }

    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| KeyError::Format(key.to_string()))?;

    Uuid::parse_str(stem).map_err(|_| KeyError::UploadId(key.to_string()))
}

pub fn master_playlist_key(asset_id: Uuid) -> String {
    format!("{}/{}/{}", STREAMING_PREFIX, asset_id, MASTER_PLAYLIST)
}
