use std::cmp::Reverse;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::StagingConfig;
use crate::domain::{
    DataAccessJob, DownloadMode, FileStatus, JobStatus, ManifestEntry, RequestId,
};
use crate::error::StagingError;
use crate::events::{EventSink, JobEvent, TracingSink};
use crate::retrieval::{ArchiveFetcher, Regenerator, RetrievalCoordinator};
use crate::store::CacheStore;

pub const CANCELLED_MESSAGE: &str = "Job cancelled because the data access cache was cleared";

/// Builds catalogue extracts synchronously while a job is created.
pub trait CataloguePackager: Send + Sync {
    fn package(&self, request_id: &RequestId, entry: &ManifestEntry) -> Result<(), StagingError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub promoted: Vec<RequestId>,
    pub failed: Vec<RequestId>,
    pub expired: Vec<RequestId>,
    pub still_preparing: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.failed.is_empty() && self.expired.is_empty()
    }
}

enum Assessment {
    Ready,
    Waiting,
    Failed(String),
}

pub struct JobLifecycleManager<S: CacheStore, A: ArchiveFetcher, G: Regenerator> {
    store: Arc<S>,
    retrieval: RetrievalCoordinator<S, A, G>,
    clock: Arc<dyn Clock>,
    config: StagingConfig,
    packager: Option<Arc<dyn CataloguePackager>>,
    sink: Arc<dyn EventSink>,
    transitions: Mutex<()>,
}

impl<S: CacheStore, A: ArchiveFetcher, G: Regenerator> JobLifecycleManager<S, A, G> {
    pub fn new(
        retrieval: RetrievalCoordinator<S, A, G>,
        clock: Arc<dyn Clock>,
        config: &StagingConfig,
    ) -> Self {
        Self {
            store: Arc::clone(retrieval.store()),
            retrieval,
            clock,
            config: config.clone(),
            packager: None,
            sink: Arc::new(TracingSink),
            transitions: Mutex::new(()),
        }
    }

    pub fn with_packager(mut self, packager: Arc<dyn CataloguePackager>) -> Self {
        self.packager = Some(packager);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn retrieval(&self) -> &RetrievalCoordinator<S, A, G> {
        &self.retrieval
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    pub fn job(&self, request_id: &RequestId) -> Result<DataAccessJob, StagingError> {
        self.store
            .load_job(request_id)?
            .ok_or_else(|| StagingError::JobNotFound(request_id.to_string()))
    }

    pub async fn create_job(
        &self,
        request_id: RequestId,
        download_mode: DownloadMode,
        manifest: Vec<ManifestEntry>,
    ) -> Result<DataAccessJob, StagingError> {
        let now = self.clock.now();
        let job = {
            let _guard = self.transitions.lock().await;
            if self.store.load_job(&request_id)?.is_some() {
                return Err(StagingError::JobAlreadyExists(request_id.to_string()));
            }
            let job = DataAccessJob::new(request_id, download_mode, manifest, now);
            self.store.save_job(&job)?;
            job
        };
        info!(
            request_id = %job.request_id,
            files = job.manifest.len(),
            mode = ?job.download_mode,
            "created job"
        );

        for entry in job.manifest.iter().filter(|entry| entry.file_type.is_catalogue()) {
            let packaged = match &self.packager {
                Some(packager) => packager.package(&job.request_id, entry),
                None => Err(StagingError::NotRetrievable(entry.file_type.to_string())),
            };
            if let Err(err) = packaged {
                let message = format!("Failed to package catalogue {}: {err}", entry.file_id);
                return self.fail(&job.request_id, message).await;
            }
        }

        match self.assess(&job, false).await? {
            Assessment::Ready => self.promote(&job.request_id).await,
            Assessment::Failed(message) => self.fail(&job.request_id, message).await,
            Assessment::Waiting => self.job(&job.request_id),
        }
    }

    pub async fn pause(&self, request_id: &RequestId) -> Result<DataAccessJob, StagingError> {
        self.admin_transition(request_id, JobStatus::Paused).await
    }

    pub async fn resume(&self, request_id: &RequestId) -> Result<DataAccessJob, StagingError> {
        self.admin_transition(request_id, JobStatus::Preparing)
            .await
    }

    /// Idempotent: a second sweep without new events changes nothing.
    pub async fn poll_and_advance(&self) -> Result<SweepReport, StagingError> {
        let mut report = SweepReport::default();

        for job in self.store.find_jobs_by_status(JobStatus::Preparing)? {
            let request_id = job.request_id.clone();
            if let Err(err) = self.advance_preparing(job, &mut report).await {
                error!(request_id = %request_id, error = %err, "failed to advance job");
            }
        }

        let now = self.clock.now();
        for job in self.store.find_jobs_by_status(JobStatus::Ready)? {
            if !job.expired_timestamp.is_some_and(|expiry| expiry <= now) {
                continue;
            }
            let expired = self
                .apply(&job.request_id, |job| {
                    if job.status != JobStatus::Ready {
                        return Ok(false);
                    }
                    job.transition(JobStatus::Expired, now)?;
                    Ok(true)
                })
                .await?;
            if let Some(job) = expired {
                info!(request_id = %job.request_id, "job expired");
                self.sink.event(JobEvent::Expired {
                    request_id: job.request_id.clone(),
                });
                report.expired.push(job.request_id);
            }
        }

        if !report.is_empty() {
            info!(
                promoted = report.promoted.len(),
                failed = report.failed.len(),
                expired = report.expired.len(),
                still_preparing = report.still_preparing,
                "lifecycle sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn cancel_all(&self) -> Result<usize, StagingError> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let mut cancelled = 0;
        for mut job in self.store.find_unexpired_jobs(now)? {
            if !job.status.is_live() {
                continue;
            }
            job.transition(JobStatus::Cancelled, now)?;
            job.expired_timestamp = Some(now);
            job.error_message = Some(CANCELLED_MESSAGE.to_string());
            self.store.save_job(&job)?;
            self.sink.event(JobEvent::Cancelled {
                request_id: job.request_id.clone(),
            });
            cancelled += 1;
        }
        warn!(cancelled, "cancelled all active jobs");
        Ok(cancelled)
    }

    pub fn failed_jobs(&self) -> Result<Vec<DataAccessJob>, StagingError> {
        let mut jobs = self.store.find_jobs_by_status(JobStatus::Error)?;
        jobs.sort_by_key(|job| Reverse(job.last_modified));
        Ok(jobs)
    }

    pub fn completed_jobs(&self) -> Result<Vec<DataAccessJob>, StagingError> {
        let mut jobs = self.store.find_jobs_by_status(JobStatus::Ready)?;
        jobs.sort_by_key(|job| Reverse(job.available_timestamp));
        Ok(jobs)
    }

    pub fn preparing_jobs(&self) -> Result<Vec<DataAccessJob>, StagingError> {
        self.oldest_first(JobStatus::Preparing)
    }

    pub fn paused_jobs(&self) -> Result<Vec<DataAccessJob>, StagingError> {
        self.oldest_first(JobStatus::Paused)
    }

    fn oldest_first(&self, status: JobStatus) -> Result<Vec<DataAccessJob>, StagingError> {
        let mut jobs = self.store.find_jobs_by_status(status)?;
        jobs.sort_by_key(|job| job.created_timestamp);
        Ok(jobs)
    }

    async fn advance_preparing(
        &self,
        job: DataAccessJob,
        report: &mut SweepReport,
    ) -> Result<(), StagingError> {
        match self.assess(&job, true).await? {
            Assessment::Ready => {
                let job = self.promote(&job.request_id).await?;
                if job.status == JobStatus::Ready {
                    report.promoted.push(job.request_id);
                }
            }
            Assessment::Failed(message) => {
                let job = self.fail(&job.request_id, message).await?;
                if job.status == JobStatus::Error {
                    report.failed.push(job.request_id);
                }
            }
            Assessment::Waiting if self.is_stale(&job, self.clock.now()) => {
                let hours = self.config.stale_job_after.num_hours();
                let message = format!("Job has been preparing for more than {hours} hours");
                let job = self.fail(&job.request_id, message).await?;
                if job.status == JobStatus::Error {
                    report.failed.push(job.request_id);
                }
            }
            Assessment::Waiting => report.still_preparing += 1,
        }
        Ok(())
    }

    fn is_stale(&self, job: &DataAccessJob, now: DateTime<Utc>) -> bool {
        now - job.last_modified > self.config.stale_job_after
    }

    async fn assess(
        &self,
        job: &DataAccessJob,
        expect_records: bool,
    ) -> Result<Assessment, StagingError> {
        let mut waiting = false;
        for entry in job.retrievable_entries() {
            if expect_records && self.store.load_cached_file(&entry.file_id)?.is_none() {
                let err = StagingError::InconsistentState(format!(
                    "job {} references missing file {}",
                    job.request_id, entry.file_id
                ));
                warn!(request_id = %job.request_id, error = %err, "re-queueing retrieval");
            }

            match self.retrieval.ensure_available(&job.request_id, entry).await {
                Ok(FileStatus::Available) => {}
                Ok(FileStatus::Pending) => waiting = true,
                Ok(FileStatus::Failed) => {
                    let detail = self
                        .store
                        .load_cached_file(&entry.file_id)?
                        .map(|file| {
                            format!(
                                " after {} attempts: {}",
                                file.retry_count,
                                file.last_error.unwrap_or_default()
                            )
                        })
                        .unwrap_or_default();
                    return Ok(Assessment::Failed(format!(
                        "File {} could not be retrieved{detail}",
                        entry.file_id
                    )));
                }
                Err(err @ StagingError::CapacityExceeded { .. }) => {
                    return Ok(Assessment::Failed(format!(
                        "File {} does not fit in the cache: {err}",
                        entry.file_id
                    )));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(if waiting {
            Assessment::Waiting
        } else {
            Assessment::Ready
        })
    }

    async fn promote(&self, request_id: &RequestId) -> Result<DataAccessJob, StagingError> {
        let now = self.clock.now();
        let ttl = self.config.ttl_for(self.job(request_id)?.download_mode);
        let Some(expires_at) = now.checked_add_signed(ttl) else {
            let message = format!("Expiry of {} hours overflows the calendar", ttl.num_hours());
            return self.fail(request_id, message).await;
        };
        let promoted = self
            .apply(request_id, |job| {
                if job.status != JobStatus::Preparing {
                    return Ok(false);
                }
                // Pin every file until this job's expiry before it becomes
                // visible as ready.
                for entry in job.retrievable_entries() {
                    if let Some(mut file) = self.store.load_cached_file(&entry.file_id)? {
                        file.extend_unlock(expires_at);
                        self.store.save_cached_file(&file)?;
                    }
                }
                job.transition(JobStatus::Ready, now)?;
                job.available_timestamp = Some(now);
                job.expired_timestamp = Some(expires_at);
                Ok(true)
            })
            .await?;

        match promoted {
            Some(job) => {
                let expires_at = job.expired_timestamp.unwrap_or(now);
                info!(request_id = %job.request_id, %expires_at, "job ready");
                self.sink.event(JobEvent::Ready {
                    request_id: job.request_id.clone(),
                    expires_at,
                });
                Ok(job)
            }
            None => self.job(request_id),
        }
    }

    async fn fail(
        &self,
        request_id: &RequestId,
        message: String,
    ) -> Result<DataAccessJob, StagingError> {
        let now = self.clock.now();
        let failed = self
            .apply(request_id, |job| {
                if job.status != JobStatus::Preparing {
                    return Ok(false);
                }
                job.transition(JobStatus::Error, now)?;
                job.error_message = Some(message.clone());
                Ok(true)
            })
            .await?;

        match failed {
            Some(job) => {
                warn!(request_id = %job.request_id, %message, "job failed");
                self.sink.event(JobEvent::Failed {
                    request_id: job.request_id.clone(),
                    message,
                });
                Ok(job)
            }
            None => self.job(request_id),
        }
    }

    async fn admin_transition(
        &self,
        request_id: &RequestId,
        next: JobStatus,
    ) -> Result<DataAccessJob, StagingError> {
        let now = self.clock.now();
        let job = self
            .apply(request_id, |job| {
                job.transition(next, now)?;
                Ok(true)
            })
            .await?;
        let job = job.ok_or_else(|| StagingError::JobNotFound(request_id.to_string()))?;
        info!(request_id = %job.request_id, status = %job.status, "admin transition");
        Ok(job)
    }

    async fn apply(
        &self,
        request_id: &RequestId,
        change: impl FnOnce(&mut DataAccessJob) -> Result<bool, StagingError>,
    ) -> Result<Option<DataAccessJob>, StagingError> {
        let _guard = self.transitions.lock().await;
        let mut job = self.job(request_id)?;
        if !change(&mut job)? {
            debug!(request_id = %request_id, status = %job.status, "transition skipped");
            return Ok(None);
        }
        self.store.save_job(&job)?;
        Ok(Some(job))
    }
}
