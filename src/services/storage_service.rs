//! src/services/storage_service.rs
//!
//! Object storage access: builds the S3 client pointed at MinIO and streams
//! objects into scratch files so the raster decoder can seek through them.

use crate::config::MinioConfig;
use futures::StreamExt;
use md5::Context;
use object_store::{ObjectStore, aws::AmazonS3Builder, path::Path as ObjectPath};
use std::{io, path::Path, sync::Arc};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info};

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("checksum mismatch for `{key}`: etag {expected}, downloaded md5 {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("object store configuration invalid: {0}")]
    Configuration(String),
    #[error(transparent)]
    ObjectStore(object_store::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// An object copied into a local scratch file.
///
/// The file is removed when this value is dropped.
#[derive(Debug)]
pub struct DownloadedObject {
    pub file: NamedTempFile,
    pub size: u64,
    pub etag: Option<String>,
}

impl DownloadedObject {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Build an S3 client for the configured MinIO bucket.
///
/// MinIO is addressed path-style; without credentials requests go unsigned.
pub fn build_store(cfg: &MinioConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::new()
        .with_endpoint(cfg.endpoint())
        .with_bucket_name(&cfg.bucket)
        .with_region(&cfg.region)
        .with_allow_http(cfg.allow_http())
        .with_virtual_hosted_style_request(false);

    match (&cfg.access_key, &cfg.secret_key) {
        (Some(access_key), Some(secret_key)) => {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }
        _ => {
            debug!("no MinIO credentials configured, using unsigned requests");
            builder = builder.with_skip_signature(true);
        }
    }

    let store = builder
        .build()
        .map_err(|err| StorageError::Configuration(err.to_string()))?;
    Ok(Arc::new(store))
}

/// Validate a key and convert it to an object-store path.
///
/// Rejects empty or oversized keys, control characters, and relative segments.
pub fn object_path(key: &str) -> StorageResult<ObjectPath> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidObjectKey(key.to_string()));
    }
    if key.bytes().any(|b| b.is_ascii_control()) {
        return Err(StorageError::InvalidObjectKey(key.to_string()));
    }
    ObjectPath::parse(key).map_err(|_| StorageError::InvalidObjectKey(key.to_string()))
}

fn map_store_error(err: object_store::Error, key: &str) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => StorageError::ObjectStore(other),
    }
}

/// True for single-part S3 ETags, which are the plain MD5 of the body.
///
/// Multipart ETags carry a `-<parts>` suffix and cannot be checked locally.
pub fn is_md5_etag(etag: &str) -> bool {
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compare a store-reported ETag with the MD5 of the downloaded bytes.
pub fn verify_etag(key: &str, etag: Option<&str>, md5_hex: &str) -> StorageResult<()> {
    let Some(expected) = etag.map(|tag| tag.trim_matches('"')) else {
        return Ok(());
    };
    if is_md5_etag(expected) && !expected.eq_ignore_ascii_case(md5_hex) {
        return Err(StorageError::IntegrityMismatch {
            key: key.to_string(),
            expected: expected.to_string(),
            actual: md5_hex.to_string(),
        });
    }
    Ok(())
}

/// Stream `key` from the store into a scratch file.
///
/// The scratch file lives in `scratch_dir` when given, else the system temp dir.
/// On any error the partial file is removed.
pub async fn download_object(
    store: &dyn ObjectStore,
    key: &str,
    scratch_dir: Option<&Path>,
) -> StorageResult<DownloadedObject> {
    let location = object_path(key)?;
    let result = store
        .get(&location)
        .await
        .map_err(|err| map_store_error(err, key))?;
    let meta = result.meta.clone();

    let mut builder = tempfile::Builder::new();
    builder.prefix(".raster-");
    let scratch = match scratch_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    let mut file = File::from_std(scratch.reopen()?);

    let mut size: u64 = 0;
    let mut digest = Context::new();
    let mut stream = result.into_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| map_store_error(err, key))?;
        size += chunk.len() as u64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    let md5 = format!("{:x}", digest.compute());
    verify_etag(key, meta.e_tag.as_deref(), &md5)?;

    info!(
        key,
        size,
        md5 = %md5,
        path = %scratch.path().display(),
        "File downloaded successfully"
    );

    Ok(DownloadedObject {
        file: scratch,
        size,
        etag: meta.e_tag,
    })
}

/// Cheap reachability probe used by the readiness endpoint.
pub async fn check_store(store: &dyn ObjectStore) -> StorageResult<()> {
    store
        .list_with_delimiter(None)
        .await
        .map(|_| ())
        .map_err(StorageError::ObjectStore)
}
