use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    #[default]
    NotStarted,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMetadata {
    pub instance_count: u32,
    pub series_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Archive state embedded in a study record. Only this subsystem writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub status: ArchiveStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default, rename = "sizeMB")]
    pub size_mb: Option<f64>,
    #[serde(default)]
    pub object_key: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub last_downloaded: Option<DateTime<Utc>>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub metadata: ArchiveMetadata,
}

impl ArchiveRecord {
    pub fn has_location(&self) -> bool {
        self.url.is_some() || self.file_name.is_some() || self.size_mb.is_some()
    }

    pub fn clear_location(&mut self) {
        self.url = None;
        self.file_name = None;
        self.size_mb = None;
        self.object_key = None;
    }

    /// True for a completed record whose retention window has elapsed at `now`.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status == ArchiveStatus::Completed
            && self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// True when the record still references a stored archive whose retention
    /// window has elapsed at `now`. A failed rerun keeps the previous archive's
    /// location, so failed records count as long as they carry an object key.
    pub fn holds_expired_archive(&self, now: DateTime<Utc>) -> bool {
        let elapsed = self.expires_at.is_some_and(|expires_at| expires_at <= now);
        match self.status {
            ArchiveStatus::Completed => elapsed,
            ArchiveStatus::Failed => elapsed && self.object_key.is_some(),
            _ => false,
        }
    }
}

/// Per-study record held by the dataset store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRecord {
    pub dataset_id: String,
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub patient_name: String,
    #[serde(default)]
    pub study_instance_uid: String,
    #[serde(default)]
    pub study_date: Option<String>,
    #[serde(default)]
    pub instance_count: u32,
    #[serde(default)]
    pub series_count: u32,
    #[serde(default)]
    pub archive: ArchiveRecord,
}

/// Result payload of a completed archive job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveOutput {
    pub url: String,
    pub object_key: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub etag: String,
    pub processing_time_ms: u64,
    pub total_files: usize,
    pub successful_conversions: usize,
}

impl ArchiveOutput {
    pub fn size_mb(&self) -> f64 {
        bytes_to_mb(self.size_bytes)
    }
}

/// Megabytes rounded to two decimals; a non-empty object never reports zero.
pub fn bytes_to_mb(size_bytes: u64) -> f64 {
    if size_bytes == 0 {
        return 0.0;
    }
    let mb = size_bytes as f64 / (1024.0 * 1024.0);
    ((mb * 100.0).round() / 100.0).max(0.01)
}
