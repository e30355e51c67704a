use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StagingError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = StagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        // File ids double as cache path components.
        let is_valid = !normalized.is_empty()
            && !normalized.chars().any(|ch| ch.is_whitespace() || ch == '/')
            && normalized != "."
            && normalized != "..";
        if !is_valid {
            return Err(StagingError::InvalidFileId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = StagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
            return Err(StagingError::InvalidRequestId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    ImageCube,
    MeasurementSet,
    Catalogue,
    ImageCutout,
    Spectrum,
    GeneratedSpectrum,
    MomentMap,
    Cubelet,
    Encapsulation,
    Evaluation,
    ErrorRecord,
}

impl FileType {
    /// Catalogues are packaged in-line and never enter the retrieval pipeline.
    pub fn is_catalogue(&self) -> bool {
        matches!(self, FileType::Catalogue)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::ImageCube => "IMAGE_CUBE",
            FileType::MeasurementSet => "MEASUREMENT_SET",
            FileType::Catalogue => "CATALOGUE",
            FileType::ImageCutout => "IMAGE_CUTOUT",
            FileType::Spectrum => "SPECTRUM",
            FileType::GeneratedSpectrum => "GENERATED_SPECTRUM",
            FileType::MomentMap => "MOMENT_MAP",
            FileType::Cubelet => "CUBELET",
            FileType::Encapsulation => "ENCAPSULATION",
            FileType::Evaluation => "EVALUATION",
            FileType::ErrorRecord => "ERROR_RECORD",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Preparing,
    Paused,
    Ready,
    Error,
    Expired,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Error | JobStatus::Expired | JobStatus::Cancelled
        )
    }

    /// A live job still pins every file in its manifest.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Preparing, Ready)
                | (Preparing, Error)
                | (Preparing, Paused)
                | (Paused, Preparing)
                | (Ready, Expired)
                | (Preparing, Cancelled)
                | (Paused, Cancelled)
                | (Ready, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Preparing => "PREPARING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Ready => "READY",
            JobStatus::Error => "ERROR",
            JobStatus::Expired => "EXPIRED",
            JobStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadMode {
    Web,
    Scripted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Available,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_id: FileId,
    pub file_type: FileType,
    #[serde(default)]
    pub original_file_path: Option<String>,
    #[serde(default)]
    pub estimated_size_kb: Option<u64>,
}

impl ManifestEntry {
    pub fn new(file_id: FileId, file_type: FileType) -> Self {
        Self {
            file_id,
            file_type,
            original_file_path: None,
            estimated_size_kb: None,
        }
    }

    pub fn with_original_path(mut self, path: impl Into<String>) -> Self {
        self.original_file_path = Some(path.into());
        self
    }

    pub fn with_estimated_size(mut self, size_kb: u64) -> Self {
        self.estimated_size_kb = Some(size_kb);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub file_id: FileId,
    pub file_type: FileType,
    pub size_kb: Option<u64>,
    pub estimated_size_kb: u64,
    pub unlock_at: Option<DateTime<Utc>>,
    pub available: bool,
    #[serde(default)]
    pub failed: bool,
    pub original_file_path: Option<String>,
    pub retry_count: u32,
    pub location: Option<Utf8PathBuf>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CachedFile {
    pub fn from_entry(entry: &ManifestEntry, default_estimate_kb: u64) -> Self {
        Self {
            file_id: entry.file_id.clone(),
            file_type: entry.file_type,
            size_kb: None,
            estimated_size_kb: entry.estimated_size_kb.unwrap_or(default_estimate_kb),
            unlock_at: None,
            available: false,
            failed: false,
            original_file_path: entry.original_file_path.clone(),
            retry_count: 0,
            location: None,
            last_error: None,
        }
    }

    /// Cutouts with a known source are regenerated rather than fetched.
    pub fn is_regenerated(&self) -> bool {
        self.file_type == FileType::ImageCutout && self.original_file_path.is_some()
    }

    pub fn is_pending(&self) -> bool {
        !self.available && !self.failed
    }

    pub fn status(&self) -> FileStatus {
        if self.failed {
            FileStatus::Failed
        } else if self.available {
            FileStatus::Available
        } else {
            FileStatus::Pending
        }
    }

    /// Moves the unlock time forward, never backward.
    pub fn extend_unlock(&mut self, until: DateTime<Utc>) {
        self.unlock_at = Some(match self.unlock_at {
            Some(current) if current > until => current,
            _ => until,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAccessJob {
    pub request_id: RequestId,
    pub status: JobStatus,
    pub created_timestamp: DateTime<Utc>,
    pub available_timestamp: Option<DateTime<Utc>>,
    pub expired_timestamp: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    pub download_mode: DownloadMode,
    pub error_message: Option<String>,
    pub manifest: Vec<ManifestEntry>,
}

impl DataAccessJob {
    pub fn new(
        request_id: RequestId,
        download_mode: DownloadMode,
        manifest: Vec<ManifestEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            status: JobStatus::Preparing,
            created_timestamp: now,
            available_timestamp: None,
            expired_timestamp: None,
            last_modified: now,
            download_mode,
            error_message: None,
            manifest,
        }
    }

    /// Entries that go through the retrieval pipeline.
    pub fn retrievable_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.manifest
            .iter()
            .filter(|entry| !entry.file_type.is_catalogue())
    }

    pub fn transition(
        &mut self,
        next: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, StagingError> {
        if !self.status.can_transition_to(next) {
            return Err(StagingError::InvalidTransition {
                request_id: self.request_id.to_string(),
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        self.last_modified = now;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn parse_file_id_trims() {
        let id: FileId = "  cube-1234.fits ".parse().unwrap();
        assert_eq!(id.as_str(), "cube-1234.fits");
    }

    #[test]
    fn parse_file_id_rejects_path_components() {
        assert_matches!(
            "../etc/passwd".parse::<FileId>(),
            Err(StagingError::InvalidFileId(_))
        );
        assert_matches!("..".parse::<FileId>(), Err(StagingError::InvalidFileId(_)));
        assert_matches!("".parse::<FileId>(), Err(StagingError::InvalidFileId(_)));
    }

    #[test]
    fn parse_request_id_rejects_whitespace() {
        let err = "abc def".parse::<RequestId>().unwrap_err();
        assert_matches!(err, StagingError::InvalidRequestId(_));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Expired.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Ready.is_live());
        assert!(JobStatus::Paused.is_live());
    }

    #[test]
    fn transition_rejects_ready_to_preparing() {
        let mut job = DataAccessJob::new(
            "req-1".parse().unwrap(),
            DownloadMode::Web,
            Vec::new(),
            at(0),
        );
        job.transition(JobStatus::Ready, at(10)).unwrap();
        assert_eq!(job.last_modified, at(10));

        let err = job.transition(JobStatus::Preparing, at(20)).unwrap_err();
        assert_matches!(
            err,
            StagingError::InvalidTransition {
                from: JobStatus::Ready,
                to: JobStatus::Preparing,
                ..
            }
        );
    }

    #[test]
    fn extend_unlock_keeps_latest() {
        let entry = ManifestEntry::new("a".parse().unwrap(), FileType::Spectrum);
        let mut file = CachedFile::from_entry(&entry, 10);
        file.extend_unlock(at(100));
        file.extend_unlock(at(50));
        assert_eq!(file.unlock_at, Some(at(100)));
        file.extend_unlock(at(200));
        assert_eq!(file.unlock_at, Some(at(200)));
    }

    #[test]
    fn cutout_with_source_is_regenerated() {
        let entry = ManifestEntry::new("cut-1".parse().unwrap(), FileType::ImageCutout)
            .with_original_path("observations/cube.fits");
        assert!(CachedFile::from_entry(&entry, 1).is_regenerated());

        let bare = ManifestEntry::new("cut-2".parse().unwrap(), FileType::ImageCutout);
        assert!(!CachedFile::from_entry(&bare, 1).is_regenerated());
    }
}
