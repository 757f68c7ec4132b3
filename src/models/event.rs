//! Normalized object events extracted from MinIO bucket notifications.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Any `s3:ObjectCreated:*` event (put, copy, multipart completion).
    Created,
    /// Any `s3:ObjectRemoved:*` event.
    Removed,
}

/// One actionable record from a webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectEvent {
    pub kind: EventKind,
    /// Raw MinIO event name, e.g. `s3:ObjectCreated:Put`.
    pub event_name: String,
    pub event_time: Option<DateTime<Utc>>,
    pub bucket: String,
    /// Percent-decoded object key, without a leading `/`.
    pub key: String,
    pub size: Option<u64>,
    pub etag: Option<String>,
}
