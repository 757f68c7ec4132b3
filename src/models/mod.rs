//! Data models shared by the webhook service.
//!
//! `event` holds the normalized form of MinIO bucket notifications and
//! `report` the raster profile documents that are returned and persisted.

pub mod event;
pub mod report;
