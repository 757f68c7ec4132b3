//! EventService: reacts to MinIO object events.
//!
//! A created raster is downloaded, profiled on the blocking pool and its report
//! persisted; a removed raster drops its stored report. Webhook deliveries are
//! processed in background tasks, at most `max_concurrency` at a time, and the
//! events of a single key are applied in the order they were delivered.

use crate::{
    models::{
        event::{EventKind, ObjectEvent},
        report::{RasterReport, StoredReport},
    },
    services::{
        raster_service::{self, RasterError},
        report_store::{ReportError, ReportRecord, ReportStore},
        storage_service::{self, StorageError},
    },
};
use object_store::ObjectStore;
use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_PENDING: usize = 1024;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("raster worker failed: {0}")]
    Worker(String),
    #[error("event backlog full: {pending} events pending, limit {limit}")]
    Backlogged { pending: usize, limit: usize },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ForeignBucket,
    NotRaster,
}

#[derive(Debug)]
pub enum EventOutcome {
    Profiled(StoredReport),
    Removed { existed: bool },
    Skipped(SkipReason),
}

/// A freshly computed report plus the object facts it was computed from.
#[derive(Debug)]
pub struct ProfiledObject {
    pub report: RasterReport,
    pub size: u64,
    pub etag: Option<String>,
}

/// Accepted events that have not finished yet.
///
/// `by_key` holds one entry per key with an active worker; its queue holds the
/// events delivered for that key while the worker was busy.
#[derive(Debug, Default)]
struct Backlog {
    by_key: HashMap<String, VecDeque<ObjectEvent>>,
    pending: usize,
}

#[derive(Clone)]
pub struct EventService {
    pub store: Arc<dyn ObjectStore>,
    pub reports: ReportStore,
    pub bucket: String,
    extensions: Arc<[String]>,
    permits: Arc<Semaphore>,
    backlog: Arc<Mutex<Backlog>>,
    max_pending: usize,
    jobs: TaskTracker,
    scratch_dir: Option<PathBuf>,
}

impl EventService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        reports: ReportStore,
        bucket: impl Into<String>,
        extensions: Vec<String>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            reports,
            bucket: bucket.into(),
            extensions: extensions.into(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            backlog: Arc::new(Mutex::new(Backlog::default())),
            max_pending: DEFAULT_MAX_PENDING,
            jobs: TaskTracker::new(),
            scratch_dir: None,
        }
    }

    /// Place scratch downloads in `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Refuse deliveries once this many accepted events are unfinished.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Case-insensitive extension match against the configured raster suffixes.
    pub fn is_raster_key(&self, key: &str) -> bool {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .extensions
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }

    pub fn skip_reason(&self, event: &ObjectEvent) -> Option<SkipReason> {
        if event.bucket != self.bucket {
            Some(SkipReason::ForeignBucket)
        } else if !self.is_raster_key(&event.key) {
            Some(SkipReason::NotRaster)
        } else {
            None
        }
    }

    /// Download `key` and compute its report without persisting it.
    pub async fn profile_key(&self, key: &str) -> ServiceResult<ProfiledObject> {
        let downloaded =
            storage_service::download_object(&*self.store, key, self.scratch_dir.as_deref())
                .await?;
        let label = key.to_string();

        // The scratch file moves into the worker and is removed when it finishes.
        let profiled = tokio::task::spawn_blocking(move || {
            let report = raster_service::read_raster_report(downloaded.path(), &label)?;
            Ok::<_, RasterError>(ProfiledObject {
                report,
                size: downloaded.size,
                etag: downloaded.etag.clone(),
            })
        })
        .await
        .map_err(|err| ServiceError::Worker(err.to_string()))??;

        Ok(profiled)
    }

    /// Profile `key` now and store the result.
    pub async fn profile_and_store(&self, key: &str, event_name: &str) -> ServiceResult<StoredReport> {
        let profiled = self.profile_key(key).await?;
        let stored = self
            .reports
            .upsert(
                ReportRecord {
                    bucket: &self.bucket,
                    key,
                    etag: profiled.etag.as_deref(),
                    size_bytes: i64::try_from(profiled.size).unwrap_or(i64::MAX),
                    event_name,
                },
                &profiled.report,
            )
            .await?;
        Ok(stored)
    }

    pub async fn process_event(&self, event: &ObjectEvent) -> ServiceResult<EventOutcome> {
        if let Some(reason) = self.skip_reason(event) {
            debug!(bucket = %event.bucket, key = %event.key, ?reason, "skipping object event");
            return Ok(EventOutcome::Skipped(reason));
        }

        debug!(
            key = %event.key,
            event_name = %event.event_name,
            event_time = ?event.event_time,
            size = ?event.size,
            "processing object event"
        );
        match event.kind {
            EventKind::Created => {
                let stored = self.profile_and_store(&event.key, &event.event_name).await?;
                Ok(EventOutcome::Profiled(stored))
            }
            EventKind::Removed => {
                let existed = self.reports.delete(&self.bucket, &event.key).await?;
                Ok(EventOutcome::Removed { existed })
            }
        }
    }

    /// Queue events for background processing.
    ///
    /// Events of one key run one after another in delivery order; different
    /// keys run in parallel up to the concurrency limit. A delivery that would
    /// push the backlog past its limit is refused as a whole so MinIO retries
    /// it later. Processing failures are only logged.
    pub fn dispatch(&self, events: Vec<ObjectEvent>) -> ServiceResult<()> {
        let mut backlog = self.lock_backlog();
        if backlog.pending + events.len() > self.max_pending {
            return Err(ServiceError::Backlogged {
                pending: backlog.pending,
                limit: self.max_pending,
            });
        }

        backlog.pending += events.len();
        for event in events {
            match backlog.by_key.entry(event.key.clone()) {
                Entry::Occupied(mut queued) => queued.get_mut().push_back(event),
                Entry::Vacant(slot) => {
                    slot.insert(VecDeque::new());
                    let service = self.clone();
                    self.jobs.spawn(service.drain_key(event));
                }
            }
        }
        Ok(())
    }

    /// Number of accepted events that have not finished.
    pub fn pending(&self) -> usize {
        self.lock_backlog().pending
    }

    /// Wait until every accepted event has been processed.
    pub async fn shutdown(&self) {
        self.jobs.close();
        self.jobs.wait().await;
    }

    fn lock_backlog(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process `event`, then every event queued behind it for the same key.
    async fn drain_key(self, mut event: ObjectEvent) {
        loop {
            self.run_event(&event).await;
            match self.finish_event(&event.key) {
                Some(queued) => event = queued,
                None => return,
            }
        }
    }

    /// Mark one event of `key` done and take the next one queued for it.
    ///
    /// The key's entry is released when nothing is left, so the next delivery
    /// for it starts a new worker.
    fn finish_event(&self, key: &str) -> Option<ObjectEvent> {
        let mut backlog = self.lock_backlog();
        backlog.pending = backlog.pending.saturating_sub(1);
        let next = backlog.by_key.get_mut(key).and_then(VecDeque::pop_front);
        if next.is_none() {
            backlog.by_key.remove(key);
        }
        next
    }

    async fn run_event(&self, event: &ObjectEvent) {
        let Ok(_permit) = self.permits.acquire().await else {
            warn!(key = %event.key, "event worker pool closed; dropping event");
            return;
        };
        match self.process_event(event).await {
            Ok(EventOutcome::Profiled(stored)) => info!(
                bucket = %stored.bucket,
                key = %stored.key,
                bands = stored.report.bands.len(),
                "raster profiled"
            ),
            Ok(EventOutcome::Removed { existed }) => {
                info!(key = %event.key, existed, "raster report removed")
            }
            Ok(EventOutcome::Skipped(_)) => {}
            Err(err) => error!(
                bucket = %event.bucket,
                key = %event.key,
                event_name = %event.event_name,
                error = %err,
                "failed to process object event"
            ),
        }
    }
}
