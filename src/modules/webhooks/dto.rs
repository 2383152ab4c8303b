use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// Event names for object creation all share this prefix
/// (`s3:ObjectCreated:Put`, `s3:ObjectCreated:Copy`, ...).
pub const OBJECT_CREATED_PREFIX: &str = "s3:ObjectCreated:";

/// S3-style bucket notification as delivered by the object store, over HTTP
/// or through the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Percent-encoded, with spaces as `+`.
    pub key: String,
}

impl NotificationRecord {
    pub fn object_created(bucket: &str, key: &str) -> Self {
        Self::new("s3:ObjectCreated:Put", bucket, key)
    }

    pub fn new(event_name: &str, bucket: &str, key: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            s3: S3Entity {
                bucket: BucketRef {
                    name: bucket.to_string(),
                },
                object: ObjectRef {
                    key: key.to_string(),
                },
            },
        }
    }

    pub fn is_object_created(&self) -> bool {
        self.event_name.starts_with(OBJECT_CREATED_PREFIX)
    }

    pub fn decoded_key(&self) -> Result<String, std::str::Utf8Error> {
        decode_key(&self.s3.object.key)
    }
}

pub fn decode_key(raw: &str) -> Result<String, std::str::Utf8Error> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
}
