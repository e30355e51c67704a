use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::{CachedFile, DataAccessJob, FileId, JobStatus, RequestId};
use crate::error::StagingError;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

pub trait CacheStore: Send + Sync + 'static {
    fn load_cached_file(&self, id: &FileId) -> Result<Option<CachedFile>, StagingError>;
    fn save_cached_file(&self, file: &CachedFile) -> Result<(), StagingError>;
    /// `None` when another caller already claimed the record.
    fn delete_cached_file(&self, id: &FileId) -> Result<Option<CachedFile>, StagingError>;
    fn sum_available_size_kb(&self) -> Result<u64, StagingError>;
    /// Files whose unlock time is strictly before `time`, earliest first.
    fn find_unlocked_before(&self, time: DateTime<Utc>) -> Result<Vec<CachedFile>, StagingError>;
    fn find_pending_files(&self) -> Result<Vec<CachedFile>, StagingError>;

    fn add_file_reference(&self, file: &FileId, job: &RequestId) -> Result<(), StagingError>;
    fn remove_file_reference(&self, file: &FileId, job: &RequestId) -> Result<(), StagingError>;
    fn jobs_referencing(&self, file: &FileId) -> Result<Vec<RequestId>, StagingError>;

    fn load_job(&self, id: &RequestId) -> Result<Option<DataAccessJob>, StagingError>;
    fn save_job(&self, job: &DataAccessJob) -> Result<(), StagingError>;
    fn find_jobs_by_status(&self, status: JobStatus) -> Result<Vec<DataAccessJob>, StagingError>;
    /// Jobs with `min < expired_timestamp <= max`.
    fn find_expiring_between(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<DataAccessJob>, StagingError>;
    /// Jobs whose expiry is unset or later than `at`.
    fn find_unexpired_jobs(&self, at: DateTime<Utc>) -> Result<Vec<DataAccessJob>, StagingError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub files: BTreeMap<FileId, CachedFile>,
    #[serde(default)]
    pub references: BTreeMap<FileId, BTreeSet<RequestId>>,
    #[serde(default)]
    pub jobs: BTreeMap<RequestId, DataAccessJob>,
}

#[derive(Debug)]
pub struct SnapshotStore {
    state: Mutex<StoreSnapshot>,
    path: Option<Utf8PathBuf>,
}

impl SnapshotStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreSnapshot {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                ..StoreSnapshot::default()
            }),
            path: None,
        }
    }

    pub fn open(path: &Utf8Path) -> Result<Self, StagingError> {
        let snapshot = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| StagingError::Filesystem(err.to_string()))?;
            serde_json::from_str::<StoreSnapshot>(&content)
                .map_err(|err| StagingError::Store(format!("corrupt snapshot {path}: {err}")))?
        } else {
            StoreSnapshot {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                ..StoreSnapshot::default()
            }
        };
        tracing::debug!(
            path = %path,
            files = snapshot.files.len(),
            jobs = snapshot.jobs.len(),
            "opened snapshot store"
        );
        Ok(Self {
            state: Mutex::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, StagingError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreSnapshot>, StagingError> {
        self.state
            .lock()
            .map_err(|_| StagingError::Store("store lock poisoned".to_string()))
    }

    fn write<T>(&self, apply: impl FnOnce(&mut StoreSnapshot) -> T) -> Result<T, StagingError> {
        let mut state = self.lock()?;
        let result = apply(&mut state);
        if let Some(path) = &self.path {
            write_snapshot_atomic(path, &state)?;
        }
        Ok(result)
    }
}

impl CacheStore for SnapshotStore {
    fn load_cached_file(&self, id: &FileId) -> Result<Option<CachedFile>, StagingError> {
        Ok(self.lock()?.files.get(id).cloned())
    }

    fn save_cached_file(&self, file: &CachedFile) -> Result<(), StagingError> {
        self.write(|state| {
            state.files.insert(file.file_id.clone(), file.clone());
        })
    }

    fn delete_cached_file(&self, id: &FileId) -> Result<Option<CachedFile>, StagingError> {
        self.write(|state| {
            state.references.remove(id);
            state.files.remove(id)
        })
    }

    fn sum_available_size_kb(&self) -> Result<u64, StagingError> {
        Ok(self
            .lock()?
            .files
            .values()
            .filter(|file| file.available)
            .filter_map(|file| file.size_kb)
            .sum())
    }

    fn find_unlocked_before(&self, time: DateTime<Utc>) -> Result<Vec<CachedFile>, StagingError> {
        let state = self.lock()?;
        let mut files = state
            .files
            .values()
            .filter(|file| file.unlock_at.is_some_and(|unlock| unlock < time))
            .cloned()
            .collect::<Vec<_>>();
        files.sort_by(|a, b| {
            a.unlock_at
                .cmp(&b.unlock_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        Ok(files)
    }

    fn find_pending_files(&self) -> Result<Vec<CachedFile>, StagingError> {
        Ok(self
            .lock()?
            .files
            .values()
            .filter(|file| file.is_pending())
            .cloned()
            .collect())
    }

    fn add_file_reference(&self, file: &FileId, job: &RequestId) -> Result<(), StagingError> {
        {
            let state = self.lock()?;
            if state
                .references
                .get(file)
                .is_some_and(|jobs| jobs.contains(job))
            {
                return Ok(());
            }
        }
        self.write(|state| {
            state
                .references
                .entry(file.clone())
                .or_default()
                .insert(job.clone());
        })
    }

    fn remove_file_reference(&self, file: &FileId, job: &RequestId) -> Result<(), StagingError> {
        if !self
            .lock()?
            .references
            .get(file)
            .is_some_and(|jobs| jobs.contains(job))
        {
            return Ok(());
        }
        self.write(|state| {
            if let Some(jobs) = state.references.get_mut(file) {
                jobs.remove(job);
                if jobs.is_empty() {
                    state.references.remove(file);
                }
            }
        })
    }

    fn jobs_referencing(&self, file: &FileId) -> Result<Vec<RequestId>, StagingError> {
        Ok(self
            .lock()?
            .references
            .get(file)
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn load_job(&self, id: &RequestId) -> Result<Option<DataAccessJob>, StagingError> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    fn save_job(&self, job: &DataAccessJob) -> Result<(), StagingError> {
        self.write(|state| {
            state.jobs.insert(job.request_id.clone(), job.clone());
        })
    }

    fn find_jobs_by_status(&self, status: JobStatus) -> Result<Vec<DataAccessJob>, StagingError> {
        let state = self.lock()?;
        Ok(sorted_by_creation(
            state.jobs.values().filter(|job| job.status == status),
        ))
    }

    fn find_expiring_between(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<DataAccessJob>, StagingError> {
        let state = self.lock()?;
        Ok(sorted_by_creation(state.jobs.values().filter(|job| {
            job.expired_timestamp
                .is_some_and(|expiry| expiry > min && expiry <= max)
        })))
    }

    fn find_unexpired_jobs(&self, at: DateTime<Utc>) -> Result<Vec<DataAccessJob>, StagingError> {
        let state = self.lock()?;
        Ok(sorted_by_creation(state.jobs.values().filter(|job| {
            job.expired_timestamp.is_none_or(|expiry| expiry > at)
        })))
    }
}

fn sorted_by_creation<'a>(jobs: impl Iterator<Item = &'a DataAccessJob>) -> Vec<DataAccessJob> {
    let mut jobs = jobs.cloned().collect::<Vec<_>>();
    jobs.sort_by(|a, b| {
        a.created_timestamp
            .cmp(&b.created_timestamp)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });
    jobs
}

fn write_snapshot_atomic(path: &Utf8Path, snapshot: &StoreSnapshot) -> Result<(), StagingError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| StagingError::Filesystem(err.to_string()))?;
    let content = serde_json::to_vec_pretty(snapshot)
        .map_err(|err| StagingError::Store(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".staging-store")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| StagingError::Filesystem(err.to_string()))?;
    temp.write_all(&content)
        .map_err(|err| StagingError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| StagingError::Filesystem(err.to_string()))?;
    Ok(())
}
