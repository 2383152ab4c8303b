pub mod encoder;
pub mod ingest;
pub mod transcoder;

/// Consumer group shared by every transcode worker.
pub const TRANSCODE_GROUP: &str = "transcoding-workers";
/// Consumer group for storage notifications in bus ingress mode.
pub const INGEST_GROUP: &str = "storage-ingest";
/// Holds dead-lettered messages for operators.
pub const DEAD_LETTER_GROUP: &str = "dead-letters";
