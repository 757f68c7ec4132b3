pub mod event_service;
pub mod minio_events;
pub mod raster_service;
pub mod report_store;
pub mod storage_service;
