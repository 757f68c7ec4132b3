//! Raster report: the JSON document produced for every profiled raster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata and per-band statistics of one raster file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RasterReport {
    /// Object key (or local path) the report was computed from.
    pub raster_file: String,
    pub driver: DriverInfo,
    pub size: RasterSize,
    /// `EPSG:<code>`, a citation string, or empty when the file carries no CRS.
    pub projection: String,
    /// Serialized as `{}` when the raster is not georeferenced.
    #[serde(
        serialize_with = "empty_map_when_none",
        deserialize_with = "none_when_empty",
        default
    )]
    pub geotransform: Option<GeoTransform>,
    pub bands: Vec<BandInfo>,
}

impl RasterReport {
    /// Pretty JSON with 4-space indentation, as printed by `stats`.
    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DriverInfo {
    pub short_name: String,
    pub long_name: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct RasterSize {
    pub x_size: u32,
    pub y_size: u32,
    pub band_count: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct GeoTransform {
    pub origin: Point,
    pub pixel_size: Point,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BandInfo {
    /// 1-based band index.
    pub band_number: u32,
    /// GDAL data type name (`Byte`, `Float32`, ...).
    pub data_type: String,
    /// `None` when every sample is NoData or NaN.
    pub statistics: Option<BandStatistics>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct BandStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

fn empty_map_when_none<S>(value: &Option<GeoTransform>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::SerializeMap;
    match value {
        Some(transform) => transform.serialize(serializer),
        None => serializer.serialize_map(Some(0))?.end(),
    }
}

fn none_when_empty<'de, D>(deserializer: D) -> Result<Option<GeoTransform>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Transform(GeoTransform),
        Empty {},
    }

    Ok(match Option::<Repr>::deserialize(deserializer)? {
        Some(Repr::Transform(transform)) => Some(transform),
        Some(Repr::Empty {}) | None => None,
    })
}

/// A report as persisted in SQLite, keyed by `(bucket, key)`.
#[derive(Serialize, Clone, Debug)]
pub struct StoredReport {
    pub id: Uuid,
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
    pub size_bytes: i64,
    /// MinIO event name that triggered the profile, or `manual`.
    pub event_name: String,
    pub processed_at: DateTime<Utc>,
    pub report: RasterReport,
}

/// Raw `raster_reports` row; `report` holds the JSON text.
#[derive(FromRow, Debug)]
pub struct ReportRow {
    pub id: Uuid,
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
    pub size_bytes: i64,
    pub event_name: String,
    pub processed_at: DateTime<Utc>,
    pub report: String,
}

impl TryFrom<ReportRow> for StoredReport {
    type Error = serde_json::Error;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        Ok(StoredReport {
            report: serde_json::from_str(&row.report)?,
            id: row.id,
            bucket: row.bucket,
            key: row.key,
            etag: row.etag,
            size_bytes: row.size_bytes,
            event_name: row.event_name,
            processed_at: row.processed_at,
        })
    }
}
