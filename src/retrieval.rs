use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::cache::CacheManager;
use crate::clock::Clock;
use crate::config::StagingConfig;
use crate::domain::{CachedFile, FileId, FileStatus, ManifestEntry, RequestId};
use crate::error::StagingError;
use crate::store::CacheStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedFile {
    pub location: Utf8PathBuf,
    pub size_kb: u64,
}

pub trait ArchiveFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        file_id: &FileId,
    ) -> impl Future<Output = Result<RetrievedFile, StagingError>> + Send;
}

/// Rebuilds a derived file (a cutout) from its source product.
pub trait Regenerator: Send + Sync + 'static {
    fn regenerate(
        &self,
        original_file_path: &str,
        file: &CachedFile,
    ) -> impl Future<Output = Result<RetrievedFile, StagingError>> + Send;
}

/// Regenerator for deployments without cutout support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRegeneration;

impl Regenerator for NoRegeneration {
    async fn regenerate(
        &self,
        original_file_path: &str,
        file: &CachedFile,
    ) -> Result<RetrievedFile, StagingError> {
        Err(StagingError::RetrievalFailed(format!(
            "no regenerator configured for {} (source {original_file_path})",
            file.file_id
        )))
    }
}

pub struct RetrievalCoordinator<S: CacheStore, A: ArchiveFetcher, G: Regenerator> {
    inner: Arc<Inner<S, A, G>>,
}

impl<S: CacheStore, A: ArchiveFetcher, G: Regenerator> Clone for RetrievalCoordinator<S, A, G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S: CacheStore, A, G> {
    store: Arc<S>,
    cache: Arc<CacheManager<S>>,
    fetcher: A,
    regenerator: G,
    clock: Arc<dyn Clock>,
    config: StagingConfig,
    permits: Semaphore,
    in_flight: Mutex<HashMap<FileId, watch::Sender<FileStatus>>>,
}

impl<S: CacheStore, A: ArchiveFetcher, G: Regenerator> RetrievalCoordinator<S, A, G> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<CacheManager<S>>,
        fetcher: A,
        regenerator: G,
        clock: Arc<dyn Clock>,
        config: &StagingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                fetcher,
                regenerator,
                clock,
                config: config.clone(),
                permits: Semaphore::new(config.max_concurrent_retrievals),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn cache(&self) -> &Arc<CacheManager<S>> {
        &self.inner.cache
    }

    pub fn fetcher(&self) -> &A {
        &self.inner.fetcher
    }

    pub fn regenerator(&self) -> &G {
        &self.inner.regenerator
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }

    /// Retrieval problems surface later as [`FileStatus::Failed`], not as errors.
    pub async fn ensure_available(
        &self,
        request_id: &RequestId,
        entry: &ManifestEntry,
    ) -> Result<FileStatus, StagingError> {
        if entry.file_type.is_catalogue() {
            return Err(StagingError::NotRetrievable(entry.file_type.to_string()));
        }
        let inner = &self.inner;
        inner
            .cache
            .attach_reference(&entry.file_id, request_id)
            .await?;

        let (file, created) = {
            let mut in_flight = inner.in_flight.lock().await;
            if in_flight.contains_key(&entry.file_id) {
                debug!(
                    file_id = %entry.file_id,
                    request_id = %request_id,
                    "joined in-flight retrieval"
                );
                return Ok(FileStatus::Pending);
            }

            let (file, created) = match inner.store.load_cached_file(&entry.file_id)? {
                Some(file) if file.failed => return Ok(FileStatus::Failed),
                Some(file) if file.available && file.size_kb.is_some() => {
                    debug!(file_id = %entry.file_id, "cache hit");
                    return Ok(FileStatus::Available);
                }
                Some(mut file) if file.available => {
                    let err = StagingError::InconsistentState(format!(
                        "{} is marked available without a size",
                        file.file_id
                    ));
                    warn!(file_id = %file.file_id, error = %err, "retrieving again");
                    file.available = false;
                    (file, false)
                }
                Some(file) => (file, false),
                None => (
                    CachedFile::from_entry(entry, inner.config.default_estimated_size_kb),
                    true,
                ),
            };

            let (sender, _) = watch::channel(FileStatus::Pending);
            in_flight.insert(file.file_id.clone(), sender);
            (file, created)
        };

        let file_id = file.file_id.clone();
        if let Err(err) = self.start(file).await {
            if created {
                inner.cache.detach_reference(&file_id, request_id).await?;
            }
            return Err(err);
        }
        Ok(FileStatus::Pending)
    }

    pub async fn wait(&self, file_id: &FileId) -> Result<Option<FileStatus>, StagingError> {
        let receiver = self
            .inner
            .in_flight
            .lock()
            .await
            .get(file_id)
            .map(watch::Sender::subscribe);

        if let Some(mut receiver) = receiver {
            loop {
                let status = *receiver.borrow_and_update();
                if status != FileStatus::Pending {
                    return Ok(Some(status));
                }
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        }

        Ok(self
            .inner
            .store
            .load_cached_file(file_id)?
            .map(|file| file.status()))
    }

    pub async fn resume_pending(&self) -> Result<usize, StagingError> {
        let mut resumed = 0;
        for file in self.inner.store.find_pending_files()? {
            if file.file_type.is_catalogue() {
                continue;
            }
            {
                let mut in_flight = self.inner.in_flight.lock().await;
                if in_flight.contains_key(&file.file_id) {
                    continue;
                }
                let (sender, _) = watch::channel(FileStatus::Pending);
                in_flight.insert(file.file_id.clone(), sender);
            }
            let file_id = file.file_id.clone();
            match self.start(file).await {
                Ok(()) => resumed += 1,
                Err(err) => warn!(file_id = %file_id, error = %err, "could not resume retrieval"),
            }
        }
        if resumed > 0 {
            info!(resumed, "resumed pending retrievals");
        }
        Ok(resumed)
    }

    async fn start(&self, mut file: CachedFile) -> Result<(), StagingError> {
        let inner = &self.inner;
        if let Err(err) = inner
            .cache
            .reserve(&file.file_id, file.estimated_size_kb)
            .await
        {
            if file.unlock_at.is_none() && inner.store.load_cached_file(&file.file_id)?.is_some() {
                // Let the record be reclaimed once no live job wants it.
                file.unlock_at = Some(inner.clock.now());
                inner.store.save_cached_file(&file)?;
            }
            inner.finish(&file.file_id, None).await;
            return Err(err);
        }

        if let Err(err) = inner.store.save_cached_file(&file) {
            inner.cache.release(&file.file_id).await;
            inner.finish(&file.file_id, None).await;
            return Err(err);
        }

        info!(
            file_id = %file.file_id,
            file_type = %file.file_type,
            estimate_kb = file.estimated_size_kb,
            retry_count = file.retry_count,
            "queued retrieval"
        );
        tokio::spawn(run_retrieval(Arc::clone(&self.inner), file));
        Ok(())
    }
}

impl<S: CacheStore, A: ArchiveFetcher, G: Regenerator> Inner<S, A, G> {
    async fn finish(&self, file_id: &FileId, status: Option<FileStatus>) {
        let sender = self.in_flight.lock().await.remove(file_id);
        if let (Some(sender), Some(status)) = (sender, status) {
            sender.send_replace(status);
        }
    }

    async fn attempt(&self, file: &CachedFile) -> Result<RetrievedFile, StagingError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StagingError::RetrievalFailed("retrieval pool closed".to_string()))?;
        match (&file.original_file_path, file.is_regenerated()) {
            (Some(original), true) => self.regenerator.regenerate(original, file).await,
            _ => self.fetcher.fetch(&file.file_id).await,
        }
    }

    async fn retrieve_with_retries(
        &self,
        file: &mut CachedFile,
    ) -> Result<FileStatus, StagingError> {
        loop {
            let attempt = file.retry_count + 1;
            debug!(file_id = %file.file_id, attempt, "retrieval attempt");

            match self.attempt(file).await {
                Ok(retrieved) => {
                    file.available = true;
                    file.size_kb = Some(retrieved.size_kb);
                    file.location = Some(retrieved.location);
                    file.last_error = None;
                    file.extend_unlock(
                        self.clock
                            .now()
                            .checked_add_signed(self.config.file_unlock)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    );
                    self.cache.commit(file).await?;
                    info!(
                        file_id = %file.file_id,
                        size_kb = retrieved.size_kb,
                        attempt,
                        "file available"
                    );
                    return Ok(FileStatus::Available);
                }
                Err(err) => {
                    file.retry_count += 1;
                    file.last_error = Some(err.to_string());

                    if file.retry_count > self.config.max_retry_count || !err.is_retryable() {
                        file.failed = true;
                        file.extend_unlock(self.clock.now());
                        self.store.save_cached_file(file)?;
                        self.cache.release(&file.file_id).await;
                        let exhausted = StagingError::RetrievalExhausted {
                            file_id: file.file_id.to_string(),
                            attempts: file.retry_count,
                        };
                        error!(
                            file_id = %file.file_id,
                            error = %exhausted,
                            last_error = %err,
                            "retrieval failed permanently"
                        );
                        return Ok(FileStatus::Failed);
                    }

                    self.store.save_cached_file(file)?;
                    let backoff = self.config.backoff_for(file.retry_count);
                    warn!(
                        file_id = %file.file_id,
                        retry_count = file.retry_count,
                        max_retry_count = self.config.max_retry_count,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrieval failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

async fn run_retrieval<S: CacheStore, A: ArchiveFetcher, G: Regenerator>(
    inner: Arc<Inner<S, A, G>>,
    mut file: CachedFile,
) {
    let file_id = file.file_id.clone();
    let status = match inner.retrieve_with_retries(&mut file).await {
        Ok(status) => Some(status),
        Err(err) => {
            error!(file_id = %file_id, error = %err, "retrieval aborted");
            inner.cache.release(&file_id).await;
            None
        }
    };
    inner.finish(&file_id, status).await;
}
