#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;

use staging_cache::cache::CacheManager;
use staging_cache::clock::{Clock, ManualClock};
use staging_cache::config::StagingConfig;
use staging_cache::domain::{CachedFile, FileId, FileStatus, FileType, ManifestEntry};
use staging_cache::error::StagingError;
use staging_cache::events::MemorySink;
use staging_cache::lifecycle::JobLifecycleManager;
use staging_cache::retrieval::{ArchiveFetcher, Regenerator, RetrievalCoordinator, RetrievedFile};
use staging_cache::store::SnapshotStore;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

pub fn file_id(id: &str) -> FileId {
    id.parse().unwrap()
}

pub fn entry(id: &str, file_type: FileType) -> ManifestEntry {
    ManifestEntry::new(file_id(id), file_type)
}

pub struct MockFetcher {
    root: Utf8PathBuf,
    default_size_kb: u64,
    sizes: HashMap<String, u64>,
    failures: AtomicUsize,
    calls: Mutex<Vec<FileId>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockFetcher {
    pub fn new(root: &Utf8Path, default_size_kb: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            default_size_kb,
            sizes: HashMap::new(),
            failures: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Fails the next `count` fetches.
    pub fn failing(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_size(mut self, id: &str, size_kb: u64) -> Self {
        self.sizes.insert(id.to_string(), size_kb);
        self
    }

    /// Holds every fetch until the gate hands out a permit.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<FileId> {
        self.calls.lock().unwrap().clone()
    }
}

impl ArchiveFetcher for MockFetcher {
    async fn fetch(&self, file_id: &FileId) -> Result<RetrievedFile, StagingError> {
        self.calls.lock().unwrap().push(file_id.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| StagingError::RetrievalFailed(err.to_string()))?
                .forget();
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(StagingError::RetrievalFailed(format!(
                "archive unavailable for {file_id}"
            )));
        }
        let location = self.root.join(file_id.as_str());
        fs::write(location.as_std_path(), b"staged")
            .map_err(|err| StagingError::Filesystem(err.to_string()))?;
        let size_kb = self
            .sizes
            .get(file_id.as_str())
            .copied()
            .unwrap_or(self.default_size_kb);
        Ok(RetrievedFile { location, size_kb })
    }
}

#[derive(Default)]
pub struct MockRegenerator {
    calls: Mutex<Vec<(String, FileId)>>,
    size_kb: u64,
}

impl MockRegenerator {
    pub fn new(size_kb: u64) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            size_kb,
        }
    }

    pub fn calls(&self) -> Vec<(String, FileId)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Regenerator for MockRegenerator {
    async fn regenerate(
        &self,
        original_file_path: &str,
        file: &CachedFile,
    ) -> Result<RetrievedFile, StagingError> {
        self.calls
            .lock()
            .unwrap()
            .push((original_file_path.to_string(), file.file_id.clone()));
        Ok(RetrievedFile {
            location: Utf8PathBuf::from(format!("{original_file_path}.cutout")),
            size_kb: self.size_kb,
        })
    }
}

pub type TestCoordinator = RetrievalCoordinator<SnapshotStore, MockFetcher, MockRegenerator>;
pub type TestLifecycle = JobLifecycleManager<SnapshotStore, MockFetcher, MockRegenerator>;

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub root: Utf8PathBuf,
    pub store: Arc<SnapshotStore>,
    pub clock: Arc<ManualClock>,
    pub config: StagingConfig,
    pub cache: Arc<CacheManager<SnapshotStore>>,
    pub retrieval: TestCoordinator,
    pub sink: Arc<MemorySink>,
}

pub fn test_config(root: &Utf8Path, max_cache_size_kb: u64) -> StagingConfig {
    StagingConfig {
        max_cache_size_kb,
        retry_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        default_estimated_size_kb: 100,
        lifecycle_sweep_interval: Duration::from_millis(10),
        expiry_sweep_interval: Duration::from_millis(10),
        reclaim_sweep_interval: Duration::from_millis(10),
        ..StagingConfig::default()
    }
    .with_cache_root(root.to_path_buf())
}

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

pub fn harness_with(
    temp: tempfile::TempDir,
    root: Utf8PathBuf,
    config: StagingConfig,
    fetcher: MockFetcher,
) -> Harness {
    let store = Arc::new(SnapshotStore::in_memory());
    let clock = Arc::new(ManualClock::new(start()));
    let cache = Arc::new(CacheManager::new(store.clone(), clock.clone(), &config).unwrap());
    let retrieval = RetrievalCoordinator::new(
        store.clone(),
        cache.clone(),
        fetcher,
        MockRegenerator::new(25),
        clock.clone(),
        &config,
    );
    Harness {
        temp,
        root,
        store,
        clock,
        config,
        cache,
        retrieval,
        sink: Arc::new(MemorySink::default()),
    }
}

pub fn harness(max_cache_size_kb: u64, size_kb: u64) -> Harness {
    let (temp, root) = temp_root();
    let config = test_config(&root, max_cache_size_kb);
    let fetcher = MockFetcher::new(&root, size_kb);
    harness_with(temp, root, config, fetcher)
}

impl Harness {
    pub fn lifecycle(&self) -> TestLifecycle {
        JobLifecycleManager::new(self.retrieval.clone(), self.clock.clone(), &self.config)
            .with_event_sink(self.sink.clone())
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn settle(&self, id: &str) -> Option<FileStatus> {
        self.retrieval.wait(&file_id(id)).await.unwrap()
    }
}
