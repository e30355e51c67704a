use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::StagingConfig;
use crate::domain::{CachedFile, FileId, RequestId};
use crate::error::StagingError;
use crate::store::CacheStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub max_size_kb: u64,
    pub used_size_kb: u64,
    pub free_size_kb: i64,
    pub used_percent: f64,
}

impl CacheHealth {
    pub fn evaluate(max_size_kb: u64, used_size_kb: u64, warn_margin_kb: u64) -> Self {
        let status = if used_size_kb >= max_size_kb.saturating_sub(warn_margin_kb) {
            HealthStatus::Warn
        } else {
            HealthStatus::Up
        };
        let used_percent = if max_size_kb == 0 {
            100.0
        } else {
            used_size_kb as f64 * 100.0 / max_size_kb as f64
        };
        Self {
            status,
            max_size_kb,
            used_size_kb,
            free_size_kb: signed_free(max_size_kb, used_size_kb),
            used_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimOutcome {
    pub files_evicted: usize,
    pub freed_kb: u64,
    pub satisfied: bool,
}

#[derive(Debug, Default)]
struct Accounting {
    committed_kb: u64,
    reservations: HashMap<FileId, u64>,
}

impl Accounting {
    fn used_kb(&self) -> u64 {
        self.committed_kb + self.reservations.values().sum::<u64>()
    }
}

pub struct CacheManager<S: CacheStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    cache_root: Utf8PathBuf,
    max_size_kb: u64,
    warn_margin_kb: u64,
    accounting: Mutex<Accounting>,
}

impl<S: CacheStore> CacheManager<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: &StagingConfig,
    ) -> Result<Self, StagingError> {
        let committed_kb = store.sum_available_size_kb()?;
        info!(
            cache_root = %config.cache_root,
            max_size_kb = config.max_cache_size_kb,
            committed_kb,
            "cache manager initialised"
        );
        Ok(Self {
            store,
            clock,
            cache_root: config.cache_root.clone(),
            max_size_kb: config.max_cache_size_kb,
            warn_margin_kb: config.warn_margin_kb,
            accounting: Mutex::new(Accounting {
                committed_kb,
                reservations: HashMap::new(),
            }),
        })
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn max_cache_size_kb(&self) -> u64 {
        self.max_size_kb
    }

    pub async fn used_cache_size_kb(&self) -> u64 {
        self.accounting.lock().await.used_kb()
    }

    pub async fn free_cache_size_kb(&self) -> i64 {
        signed_free(self.max_size_kb, self.used_cache_size_kb().await)
    }

    pub async fn is_reserved(&self, file_id: &FileId) -> bool {
        self.accounting
            .lock()
            .await
            .reservations
            .contains_key(file_id)
    }

    pub async fn health(&self) -> CacheHealth {
        CacheHealth::evaluate(
            self.max_size_kb,
            self.used_cache_size_kb().await,
            self.warn_margin_kb,
        )
    }

    pub async fn attach_reference(
        &self,
        file_id: &FileId,
        request_id: &RequestId,
    ) -> Result<(), StagingError> {
        let _accounting = self.accounting.lock().await;
        self.store.add_file_reference(file_id, request_id)
    }

    pub async fn detach_reference(
        &self,
        file_id: &FileId,
        request_id: &RequestId,
    ) -> Result<(), StagingError> {
        let _accounting = self.accounting.lock().await;
        self.store.remove_file_reference(file_id, request_id)
    }

    /// Reserving the same file twice is a no-op.
    pub async fn reserve(&self, file_id: &FileId, estimate_kb: u64) -> Result<(), StagingError> {
        let mut accounting = self.accounting.lock().await;
        if accounting.reservations.contains_key(file_id) {
            return Ok(());
        }

        if signed_free(self.max_size_kb, accounting.used_kb()) < estimate_kb as i64 {
            let outcome = self.evict_locked(&mut accounting, Some(estimate_kb))?;
            if !outcome.satisfied {
                let available_kb = signed_free(self.max_size_kb, accounting.used_kb());
                warn!(
                    file_id = %file_id,
                    required_kb = estimate_kb,
                    available_kb,
                    evicted = outcome.files_evicted,
                    "cannot reserve cache space"
                );
                return Err(StagingError::CapacityExceeded {
                    required_kb: estimate_kb,
                    available_kb,
                });
            }
        }

        accounting.reservations.insert(file_id.clone(), estimate_kb);
        debug!(
            file_id = %file_id,
            estimate_kb,
            used_kb = accounting.used_kb(),
            "reserved cache space"
        );
        Ok(())
    }

    pub async fn commit(&self, file: &CachedFile) -> Result<(), StagingError> {
        let size_kb = file.size_kb.ok_or_else(|| {
            StagingError::InconsistentState(format!("commit of {} without a size", file.file_id))
        })?;
        let mut accounting = self.accounting.lock().await;
        self.store.save_cached_file(file)?;
        let reserved = accounting.reservations.remove(&file.file_id).unwrap_or(0);
        accounting.committed_kb += size_kb;
        if accounting.used_kb() > self.max_size_kb {
            warn!(
                file_id = %file.file_id,
                used_kb = accounting.used_kb(),
                max_kb = self.max_size_kb,
                "cache over-committed after retrieval"
            );
        }
        debug!(
            file_id = %file.file_id,
            reserved_kb = reserved,
            size_kb,
            delta_kb = size_kb as i64 - reserved as i64,
            "committed cache space"
        );
        Ok(())
    }

    pub async fn release(&self, file_id: &FileId) {
        let mut accounting = self.accounting.lock().await;
        if let Some(reserved) = accounting.reservations.remove(file_id) {
            debug!(file_id = %file_id, reserved_kb = reserved, "released reservation");
        }
    }

    /// Evicts eligible files, earliest unlock first.
    pub async fn reclaim_space(&self, required_kb: u64) -> Result<ReclaimOutcome, StagingError> {
        let mut accounting = self.accounting.lock().await;
        let outcome = self.evict_locked(&mut accounting, Some(required_kb))?;
        if outcome.files_evicted > 0 || !outcome.satisfied {
            info!(
                required_kb,
                evicted = outcome.files_evicted,
                freed_kb = outcome.freed_kb,
                satisfied = outcome.satisfied,
                used_kb = accounting.used_kb(),
                "reclaim finished"
            );
        }
        Ok(outcome)
    }

    pub async fn purge_eligible(&self) -> Result<ReclaimOutcome, StagingError> {
        let mut accounting = self.accounting.lock().await;
        let outcome = self.evict_locked(&mut accounting, None)?;
        info!(
            evicted = outcome.files_evicted,
            freed_kb = outcome.freed_kb,
            "purged eligible files"
        );
        Ok(outcome)
    }

    fn evict_locked(
        &self,
        accounting: &mut Accounting,
        required_kb: Option<u64>,
    ) -> Result<ReclaimOutcome, StagingError> {
        let is_satisfied = |accounting: &Accounting| match required_kb {
            Some(required) => {
                signed_free(self.max_size_kb, accounting.used_kb()) >= required as i64
            }
            None => false,
        };

        let mut outcome = ReclaimOutcome::default();
        let now = self.clock.now();
        for candidate in self.store.find_unlocked_before(now)? {
            if is_satisfied(accounting) {
                break;
            }
            if accounting.reservations.contains_key(&candidate.file_id) {
                continue;
            }
            if self.pinned_by_live_job(&candidate.file_id)? {
                debug!(file_id = %candidate.file_id, "skipping file pinned by a live job");
                continue;
            }
            let Some(claimed) = self.store.delete_cached_file(&candidate.file_id)? else {
                continue;
            };

            self.remove_bytes(&claimed);
            let freed = if claimed.available {
                claimed.size_kb.unwrap_or(0)
            } else {
                0
            };
            accounting.committed_kb = accounting.committed_kb.saturating_sub(freed);
            outcome.files_evicted += 1;
            outcome.freed_kb += freed;
            info!(
                file_id = %claimed.file_id,
                file_type = %claimed.file_type,
                freed_kb = freed,
                "evicted cached file"
            );
        }

        outcome.satisfied = required_kb.is_none() || is_satisfied(accounting);
        Ok(outcome)
    }

    fn pinned_by_live_job(&self, file_id: &FileId) -> Result<bool, StagingError> {
        for request_id in self.store.jobs_referencing(file_id)? {
            if let Some(job) = self.store.load_job(&request_id)? {
                if job.status.is_live() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn remove_bytes(&self, file: &CachedFile) {
        let Some(location) = &file.location else {
            return;
        };
        let escapes_root = !location.starts_with(&self.cache_root)
            || location
                .components()
                .any(|component| matches!(component, Utf8Component::ParentDir));
        if escapes_root {
            warn!(
                file_id = %file.file_id,
                location = %location,
                cache_root = %self.cache_root,
                "refusing to delete bytes outside the cache root"
            );
            return;
        }

        let path = location.as_std_path();
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                file_id = %file.file_id,
                location = %location,
                error = %err,
                "failed to delete cached bytes"
            ),
        }
    }
}

fn signed_free(max_kb: u64, used_kb: u64) -> i64 {
    max_kb as i64 - used_kb as i64
}
