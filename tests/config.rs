use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use staging_cache::config::{Config, ConfigLoader, MAX_HOURS, StagingConfig};
use staging_cache::domain::DownloadMode;
use staging_cache::error::StagingError;

#[test]
fn empty_config_uses_defaults() {
    let config = Config {
        cache_root: Some("/var/cache/staging".to_string()),
        ..Config::default()
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    let defaults = StagingConfig::default();
    assert_eq!(resolved.cache_root.as_str(), "/var/cache/staging");
    assert_eq!(resolved.max_cache_size_kb, defaults.max_cache_size_kb);
    assert_eq!(resolved.max_retry_count, 2);
    assert_eq!(resolved.retry_backoff, Duration::from_secs(30));
    assert_eq!(resolved.max_concurrent_retrievals, 4);
    assert_eq!(resolved.ttl_for(DownloadMode::Scripted), chrono::Duration::hours(336));
    assert_eq!(resolved.stale_job_after, chrono::Duration::hours(48));
    assert_eq!(resolved.lifecycle_sweep_interval, Duration::from_secs(60));
}

#[test]
fn file_overrides_are_applied() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("staging-cache.json");
    fs::write(
        &path,
        r#"{
            "cache_root": "/data/cache",
            "max_cache_size_kb": 5200,
            "warn_margin_kb": 200,
            "max_retry_count": 5,
            "retry_backoff_ms": 250,
            "web_ttl_hours": 12,
            "expiry_warning_hours": 6,
            "reclaim_sweep_secs": 30
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.cache_root.as_str(), "/data/cache");
    assert_eq!(resolved.max_cache_size_kb, 5200);
    assert_eq!(resolved.warn_margin_kb, 200);
    assert_eq!(resolved.max_retry_count, 5);
    assert_eq!(resolved.retry_backoff, Duration::from_millis(250));
    assert_eq!(resolved.ttl_for(DownloadMode::Web), chrono::Duration::hours(12));
    assert_eq!(resolved.expiry_warning, chrono::Duration::hours(6));
    assert_eq!(resolved.reclaim_sweep_interval, Duration::from_secs(30));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");

    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, StagingError::ConfigRead(missing) if missing == path);
}

#[test]
fn malformed_file_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    fs::write(&path, "{ \"max_cache_size_kb\": \"lots\" }").unwrap();

    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, StagingError::ConfigParse(_));
}

#[test]
fn zero_limits_are_rejected() {
    let err = ConfigLoader::resolve_config(Config {
        cache_root: Some("/tmp/cache".to_string()),
        max_cache_size_kb: Some(0),
        ..Config::default()
    })
    .unwrap_err();
    assert_matches!(err, StagingError::ConfigParse(message) if message.contains("max_cache_size_kb"));

    let err = ConfigLoader::resolve_config(Config {
        cache_root: Some("/tmp/cache".to_string()),
        max_concurrent_retrievals: Some(0),
        ..Config::default()
    })
    .unwrap_err();
    assert_matches!(err, StagingError::ConfigParse(_));
}

#[test]
fn oversized_hours_are_rejected() {
    let err = ConfigLoader::resolve_config(Config {
        cache_root: Some("/tmp/cache".to_string()),
        web_ttl_hours: Some(10_000_000_000),
        ..Config::default()
    })
    .unwrap_err();
    assert_matches!(err, StagingError::ConfigParse(message) if message.contains("web_ttl_hours"));

    let err = ConfigLoader::resolve_config(Config {
        cache_root: Some("/tmp/cache".to_string()),
        stale_job_hours: Some(u64::MAX),
        ..Config::default()
    })
    .unwrap_err();
    assert_matches!(err, StagingError::ConfigParse(message) if message.contains("stale_job_hours"));

    let resolved = ConfigLoader::resolve_config(Config {
        cache_root: Some("/tmp/cache".to_string()),
        file_unlock_hours: Some(MAX_HOURS),
        ..Config::default()
    })
    .unwrap();
    assert_eq!(resolved.file_unlock, chrono::Duration::hours(MAX_HOURS as i64));
}
