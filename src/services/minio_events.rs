//! MinIO bucket notification parsing.
//!
//! MinIO posts S3-compatible event notifications to webhook targets. Payloads
//! usually arrive as `{ "Records": [...] }`, but a bare array or a single
//! record is accepted as well. Malformed records are skipped with a warning
//! instead of rejecting the whole delivery.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::event::{EventKind, ObjectEvent};

#[derive(Debug, Deserialize)]
struct MinioRecord {
    #[serde(rename = "eventName")]
    event_name: String,

    #[serde(rename = "eventTime")]
    #[serde(default)]
    event_time: Option<String>,

    s3: MinioS3,
}

#[derive(Debug, Deserialize)]
struct MinioS3 {
    bucket: MinioBucket,
    object: MinioObject,
}

#[derive(Debug, Deserialize)]
struct MinioBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MinioObject {
    key: String,

    #[serde(default)]
    size: Option<u64>,

    #[serde(rename = "eTag")]
    #[serde(default)]
    e_tag: Option<String>,
}

/// Result of parsing one webhook delivery.
#[derive(Debug, Default)]
pub struct ParsedPayload {
    pub events: Vec<ObjectEvent>,
    /// Records that were malformed or of an unsupported event type.
    pub ignored: usize,
}

fn classify_event_name(event_name: &str) -> Option<EventKind> {
    if event_name.contains("ObjectCreated") {
        Some(EventKind::Created)
    } else if event_name.contains("ObjectRemoved") {
        Some(EventKind::Removed)
    } else {
        None
    }
}

fn parse_event_time(event_time: Option<&str>) -> Option<DateTime<Utc>> {
    event_time
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Decode `%XX` escapes and `+` as used in S3 notification keys.
///
/// Invalid escapes are kept verbatim.
pub fn decode_object_key(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn extract_record_values(input: Value) -> Vec<Value> {
    match input {
        Value::Object(mut map) => match map.remove("Records") {
            Some(Value::Array(records)) => records,
            Some(Value::Null) => Vec::new(),
            Some(other) => {
                map.insert("Records".into(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        Value::Array(records) => records,
        other => vec![other],
    }
}

/// Turn a webhook body into normalized object events.
pub fn parse_payload(input: Value) -> ParsedPayload {
    let record_values = extract_record_values(input);
    if record_values.is_empty() {
        debug!("minio webhook payload contained no records");
        return ParsedPayload::default();
    }

    let mut parsed = ParsedPayload {
        events: Vec::with_capacity(record_values.len()),
        ignored: 0,
    };

    for record_value in record_values {
        let record: MinioRecord = match serde_json::from_value(record_value) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to parse minio record; skipping");
                parsed.ignored += 1;
                continue;
            }
        };

        let Some(kind) = classify_event_name(&record.event_name) else {
            debug!(
                bucket = %record.s3.bucket.name,
                event_name = %record.event_name,
                "ignoring unsupported minio event"
            );
            parsed.ignored += 1;
            continue;
        };

        let decoded_key = decode_object_key(&record.s3.object.key);
        let key = decoded_key.trim_start_matches('/').to_string();
        if key.is_empty() {
            warn!(event_name = %record.event_name, "minio record has an empty object key; skipping");
            parsed.ignored += 1;
            continue;
        }

        parsed.events.push(ObjectEvent {
            kind,
            event_time: parse_event_time(record.event_time.as_deref()),
            event_name: record.event_name,
            bucket: record.s3.bucket.name,
            key,
            size: record.s3.object.size,
            etag: record
                .s3
                .object
                .e_tag
                .map(|tag| tag.trim_matches('"').to_string())
                .filter(|tag| !tag.is_empty()),
        });
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(payload: &str) -> ParsedPayload {
        parse_payload(serde_json::from_str(payload).unwrap())
    }

    #[test]
    fn parses_object_created_record() {
        let parsed = parse(
            r#"{
                "EventName": "s3:ObjectCreated:Put",
                "Key": "rasters/SEN_soc.tif",
                "Records": [
                    {
                        "eventVersion": "2.0",
                        "eventSource": "minio:s3",
                        "eventName": "s3:ObjectCreated:Put",
                        "eventTime": "2024-05-06T07:08:09.000Z",
                        "s3": {
                            "bucket": { "name": "rasters" },
                            "object": {
                                "key": "soil%2FSEN_soc.tif",
                                "size": 1024,
                                "eTag": "d41d8cd98f00b204e9800998ecf8427e"
                            }
                        }
                    }
                ]
            }"#,
        );

        assert_eq!(parsed.ignored, 0);
        assert_eq!(parsed.events.len(), 1);
        let event = &parsed.events[0];
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.bucket, "rasters");
        assert_eq!(event.key, "soil/SEN_soc.tif");
        assert_eq!(event.size, Some(1024));
        assert_eq!(
            event.etag.as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert_eq!(
            event.event_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap())
        );
    }

    #[test]
    fn parses_removed_record_and_decodes_spaces() {
        let parsed = parse(
            r#"{"Records": [{
                "eventName": "s3:ObjectRemoved:Delete",
                "s3": {
                    "bucket": { "name": "rasters" },
                    "object": { "key": "/old+maps%2Ffile%20name.tif" }
                }
            }]}"#,
        );

        assert_eq!(parsed.events.len(), 1);
        let event = &parsed.events[0];
        assert_eq!(event.kind, EventKind::Removed);
        assert_eq!(event.key, "old maps/file name.tif");
        assert_eq!(event.event_time, None);
    }

    #[test]
    fn accepts_single_record_and_bare_array() {
        let single = parse(
            r#"{
                "eventName": "s3:ObjectCreated:CompleteMultipartUpload",
                "s3": { "bucket": { "name": "b" }, "object": { "key": "a.tif" } }
            }"#,
        );
        assert_eq!(single.events.len(), 1);

        let array = parse(
            r#"[
                { "eventName": "s3:ObjectCreated:Copy",
                  "s3": { "bucket": { "name": "b" }, "object": { "key": "a.tif" } } },
                { "eventName": "s3:ObjectRemoved:Delete",
                  "s3": { "bucket": { "name": "b" }, "object": { "key": "b.tif" } } }
            ]"#,
        );
        assert_eq!(array.events.len(), 2);
    }

    #[test]
    fn skips_malformed_and_unsupported_records() {
        let parsed = parse(
            r#"{"Records": [
                { "eventName": "s3:ObjectCreated:Put" },
                { "eventName": "s3:ObjectAccessed:Get",
                  "s3": { "bucket": { "name": "b" }, "object": { "key": "a.tif" } } },
                { "eventName": "s3:ObjectCreated:Put",
                  "s3": { "bucket": { "name": "b" }, "object": { "key": "ok.tif" } } }
            ]}"#,
        );
        assert_eq!(parsed.ignored, 2);
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.events[0].key, "ok.tif");
    }

    #[test]
    fn empty_records_yield_nothing() {
        let parsed = parse(r#"{"Records": []}"#);
        assert!(parsed.events.is_empty());
        assert_eq!(parsed.ignored, 0);
    }

    #[test]
    fn decoder_keeps_invalid_escapes() {
        assert_eq!(decode_object_key("100%25"), "100%");
        assert_eq!(decode_object_key("bad%zzkey"), "bad%zzkey");
        assert_eq!(decode_object_key("trailing%2"), "trailing%2");
        assert_eq!(decode_object_key("%"), "%");
    }
}
