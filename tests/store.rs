use camino::Utf8PathBuf;
use chrono::{Duration, TimeZone, Utc};

use staging_cache::domain::{CachedFile, DataAccessJob, DownloadMode, FileType, JobStatus, ManifestEntry};
use staging_cache::store::{CacheStore, SNAPSHOT_SCHEMA_VERSION, SnapshotStore};

fn job(id: &str, minutes: i64, status: JobStatus) -> DataAccessJob {
    let created = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes);
    let mut job = DataAccessJob::new(id.parse().unwrap(), DownloadMode::Web, Vec::new(), created);
    job.status = status;
    job
}

#[test]
fn jobs_by_status_oldest_first() {
    let store = SnapshotStore::in_memory();
    store.save_job(&job("c", 30, JobStatus::Preparing)).unwrap();
    store.save_job(&job("a", 10, JobStatus::Preparing)).unwrap();
    store.save_job(&job("b", 20, JobStatus::Ready)).unwrap();
    store.save_job(&job("d", 0, JobStatus::Preparing)).unwrap();

    let ids = store
        .find_jobs_by_status(JobStatus::Preparing)
        .unwrap()
        .into_iter()
        .map(|job| job.request_id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["d", "a", "c"]);
}

#[test]
fn unexpired_includes_jobs_without_expiry() {
    let store = SnapshotStore::in_memory();
    let now = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
    let mut past = job("past", 0, JobStatus::Ready);
    past.expired_timestamp = Some(now);
    let mut future = job("future", 1, JobStatus::Ready);
    future.expired_timestamp = Some(now + Duration::seconds(1));
    for job in [past, future, job("open", 2, JobStatus::Preparing)] {
        store.save_job(&job).unwrap();
    }

    let ids = store
        .find_unexpired_jobs(now)
        .unwrap()
        .into_iter()
        .map(|job| job.request_id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["future", "open"]);
}

#[test]
fn available_size_counts_committed_files_only() {
    let store = SnapshotStore::in_memory();
    let mut committed = CachedFile::from_entry(
        &ManifestEntry::new("committed".parse().unwrap(), FileType::ImageCube),
        100,
    );
    committed.available = true;
    committed.size_kb = Some(1700);
    let pending = CachedFile::from_entry(
        &ManifestEntry::new("pending".parse().unwrap(), FileType::Spectrum),
        300,
    );
    store.save_cached_file(&committed).unwrap();
    store.save_cached_file(&pending).unwrap();

    assert_eq!(store.sum_available_size_kb().unwrap(), 1700);
    let pending_ids = store
        .find_pending_files()
        .unwrap()
        .into_iter()
        .map(|file| file.file_id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(pending_ids, vec!["pending"]);
}

#[test]
fn file_backed_store_writes_a_versioned_snapshot() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("store.json")).unwrap();

    let store = SnapshotStore::open(&path).unwrap();
    assert_eq!(store.path(), Some(path.as_path()));
    store.save_job(&job("job-1", 0, JobStatus::Preparing)).unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path.as_std_path()).unwrap()).unwrap();
    assert_eq!(raw["schema_version"], SNAPSHOT_SCHEMA_VERSION);
    assert_eq!(raw["jobs"]["job-1"]["status"], "PREPARING");
    assert_eq!(store.snapshot().unwrap().jobs.len(), 1);
}

#[test]
fn removing_the_last_reference_drops_the_entry() {
    let store = SnapshotStore::in_memory();
    let file = "cube-1".parse().unwrap();
    let (a, b) = ("job-a".parse().unwrap(), "job-b".parse().unwrap());
    store.add_file_reference(&file, &a).unwrap();
    store.add_file_reference(&file, &b).unwrap();

    store.remove_file_reference(&file, &a).unwrap();
    assert_eq!(store.jobs_referencing(&file).unwrap(), vec![b.clone()]);

    store.remove_file_reference(&file, &b).unwrap();
    store.remove_file_reference(&file, &b).unwrap();
    assert!(store.jobs_referencing(&file).unwrap().is_empty());
    assert!(store.snapshot().unwrap().references.is_empty());
}
