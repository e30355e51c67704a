use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::DownloadMode;
use crate::error::StagingError;

pub const DEFAULT_CONFIG_FILE: &str = "staging-cache.json";

/// Upper bound for every hour-valued setting (100 years).
pub const MAX_HOURS: u64 = 876_000;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub max_cache_size_kb: Option<u64>,
    #[serde(default)]
    pub warn_margin_kb: Option<u64>,
    #[serde(default)]
    pub max_retry_count: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrent_retrievals: Option<usize>,
    #[serde(default)]
    pub default_estimated_size_kb: Option<u64>,
    #[serde(default)]
    pub file_unlock_hours: Option<u64>,
    #[serde(default)]
    pub web_ttl_hours: Option<u64>,
    #[serde(default)]
    pub scripted_ttl_hours: Option<u64>,
    #[serde(default)]
    pub stale_job_hours: Option<u64>,
    #[serde(default)]
    pub lifecycle_sweep_secs: Option<u64>,
    #[serde(default)]
    pub expiry_sweep_secs: Option<u64>,
    #[serde(default)]
    pub reclaim_sweep_secs: Option<u64>,
    #[serde(default)]
    pub reclaim_headroom_kb: Option<u64>,
    #[serde(default)]
    pub expiry_warning_hours: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub cache_root: Utf8PathBuf,
    pub max_cache_size_kb: u64,
    pub warn_margin_kb: u64,
    pub max_retry_count: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub max_concurrent_retrievals: usize,
    pub default_estimated_size_kb: u64,
    pub file_unlock: chrono::Duration,
    pub web_ttl: chrono::Duration,
    pub scripted_ttl: chrono::Duration,
    pub stale_job_after: chrono::Duration,
    pub lifecycle_sweep_interval: Duration,
    pub expiry_sweep_interval: Duration,
    pub reclaim_sweep_interval: Duration,
    pub reclaim_headroom_kb: u64,
    pub expiry_warning: chrono::Duration,
}

impl StagingConfig {
    pub fn ttl_for(&self, mode: DownloadMode) -> chrono::Duration {
        match mode {
            DownloadMode::Web => self.web_ttl,
            DownloadMode::Scripted => self.scripted_ttl,
        }
    }

    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn with_cache_root(mut self, cache_root: Utf8PathBuf) -> Self {
        self.cache_root = cache_root;
        self
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            cache_root: Utf8PathBuf::from(".staging-cache"),
            max_cache_size_kb: 100 * 1024 * 1024,
            warn_margin_kb: 0,
            max_retry_count: 2,
            retry_backoff: Duration::from_millis(30_000),
            max_backoff: Duration::from_millis(600_000),
            max_concurrent_retrievals: 4,
            default_estimated_size_kb: 1024,
            file_unlock: chrono::Duration::hours(168),
            web_ttl: chrono::Duration::hours(168),
            scripted_ttl: chrono::Duration::hours(336),
            stale_job_after: chrono::Duration::hours(48),
            lifecycle_sweep_interval: Duration::from_secs(60),
            expiry_sweep_interval: Duration::from_secs(3600),
            reclaim_sweep_interval: Duration::from_secs(300),
            reclaim_headroom_kb: 0,
            expiry_warning: chrono::Duration::hours(24),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<StagingConfig, StagingError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        // Without an explicit path a missing file just means defaults.
        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| StagingError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| StagingError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<StagingConfig, StagingError> {
        let defaults = StagingConfig::default();

        let cache_root = match config.cache_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_cache_root()?,
        };

        let max_cache_size_kb = config
            .max_cache_size_kb
            .unwrap_or(defaults.max_cache_size_kb);
        if max_cache_size_kb == 0 {
            return Err(StagingError::ConfigParse(
                "max_cache_size_kb must be greater than zero".to_string(),
            ));
        }

        let max_concurrent_retrievals = config
            .max_concurrent_retrievals
            .unwrap_or(defaults.max_concurrent_retrievals);
        if max_concurrent_retrievals == 0 {
            return Err(StagingError::ConfigParse(
                "max_concurrent_retrievals must be greater than zero".to_string(),
            ));
        }

        let hours = |field: &str, value: Option<u64>, fallback: chrono::Duration| match value {
            None => Ok(fallback),
            Some(hours) if hours <= MAX_HOURS => i64::try_from(hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .ok_or_else(|| StagingError::ConfigParse(format!("{field} is out of range"))),
            Some(_) => Err(StagingError::ConfigParse(format!(
                "{field} must not exceed {MAX_HOURS} hours"
            ))),
        };
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };

        let file_unlock = hours(
            "file_unlock_hours",
            config.file_unlock_hours,
            defaults.file_unlock,
        )?;
        let web_ttl = hours(
            "web_ttl_hours",
            config.web_ttl_hours,
            defaults.web_ttl,
        )?;
        let scripted_ttl = hours(
            "scripted_ttl_hours",
            config.scripted_ttl_hours,
            defaults.scripted_ttl,
        )?;
        let stale_job_after = hours(
            "stale_job_hours",
            config.stale_job_hours,
            defaults.stale_job_after,
        )?;
        let expiry_warning = hours(
            "expiry_warning_hours",
            config.expiry_warning_hours,
            defaults.expiry_warning,
        )?;

        Ok(StagingConfig {
            cache_root,
            max_cache_size_kb,
            warn_margin_kb: config.warn_margin_kb.unwrap_or(defaults.warn_margin_kb),
            max_retry_count: config.max_retry_count.unwrap_or(defaults.max_retry_count),
            retry_backoff: config
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            max_backoff: config
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            max_concurrent_retrievals,
            default_estimated_size_kb: config
                .default_estimated_size_kb
                .unwrap_or(defaults.default_estimated_size_kb),
            file_unlock,
            web_ttl,
            scripted_ttl,
            stale_job_after,
            lifecycle_sweep_interval: secs(
                config.lifecycle_sweep_secs,
                defaults.lifecycle_sweep_interval,
            ),
            expiry_sweep_interval: secs(config.expiry_sweep_secs, defaults.expiry_sweep_interval),
            reclaim_sweep_interval: secs(
                config.reclaim_sweep_secs,
                defaults.reclaim_sweep_interval,
            ),
            reclaim_headroom_kb: config
                .reclaim_headroom_kb
                .unwrap_or(defaults.reclaim_headroom_kb),
            expiry_warning,
        })
    }
}

pub fn default_cache_root() -> Result<Utf8PathBuf, StagingError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("staging-cache")).ok()
        })
        .ok_or_else(|| StagingError::Filesystem("unable to resolve cache directory".to_string()))
}
