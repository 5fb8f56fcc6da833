use std::sync::Arc;

use archivist_common::{
    error::Result,
    time,
    types::{ArchiveMetadata, ArchiveOutput, ArchiveRecord, ArchiveStatus, JobId},
};
use chrono::Duration;
use tracing::{info, warn};

use crate::store::DatasetStore;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The record now points at the new archive. Carries the object key of the
    /// archive it replaced, if any.
    Applied { superseded_key: Option<String> },
    /// Another job took over the dataset while this one ran; nothing was written.
    Stale { current_job: Option<JobId> },
}

/// Write path into the dataset store's archive field group.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn DatasetStore>,
    retention: Duration,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn DatasetStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub fn store(&self) -> Arc<dyn DatasetStore> {
        Arc::clone(&self.store)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn mark_processing(
        &self,
        dataset_id: &str,
        job_id: JobId,
        instance_count: u32,
        series_count: u32,
    ) -> Result<ArchiveRecord> {
        let archive = self
            .store
            .update_archive(
                dataset_id,
                Box::new(move |archive| {
                    archive.status = ArchiveStatus::Processing;
                    archive.job_id = Some(job_id);
                    archive.metadata = ArchiveMetadata {
                        instance_count,
                        series_count,
                        processing_time_ms: None,
                        error: None,
                    };
                }),
            )
            .await?;
        info!(dataset_id = %dataset_id, job_id = %job_id, "archive processing");
        Ok(archive)
    }

    /// Claims the record for a freshly submitted job. Does nothing once the
    /// job's own worker has written the record.
    pub async fn mark_queued(
        &self,
        dataset_id: &str,
        job_id: JobId,
        instance_count: u32,
        series_count: u32,
    ) -> Result<ArchiveRecord> {
        self.store
            .update_archive(
                dataset_id,
                Box::new(move |archive| {
                    if archive.job_id == Some(job_id) {
                        return;
                    }
                    archive.status = ArchiveStatus::Processing;
                    archive.job_id = Some(job_id);
                    archive.metadata = ArchiveMetadata {
                        instance_count,
                        series_count,
                        processing_time_ms: None,
                        error: None,
                    };
                }),
            )
            .await
    }

    pub async fn mark_completed(
        &self,
        dataset_id: &str,
        job_id: JobId,
        output: &ArchiveOutput,
    ) -> Result<CompletionOutcome> {
        let now = time::now();
        let expires_at = now + self.retention;
        let output = output.clone();
        let outcome_slot = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&outcome_slot);

        self.store
            .update_archive(
                dataset_id,
                Box::new(move |archive| {
                    if !owns_record(archive, job_id) {
                        *lock_slot(&slot) = Some(CompletionOutcome::Stale {
                            current_job: archive.job_id,
                        });
                        return;
                    }

                    let superseded_key = archive
                        .object_key
                        .take()
                        .filter(|previous| *previous != output.object_key);
                    archive.status = ArchiveStatus::Completed;
                    archive.url = Some(output.url.clone());
                    archive.file_name = Some(output.file_name.clone());
                    archive.size_mb = Some(output.size_mb());
                    archive.object_key = Some(output.object_key.clone());
                    archive.created_at = Some(now);
                    archive.expires_at = Some(expires_at);
                    archive.job_id = Some(job_id);
                    archive.metadata.processing_time_ms = Some(output.processing_time_ms);
                    archive.metadata.error = None;
                    *lock_slot(&slot) = Some(CompletionOutcome::Applied { superseded_key });
                }),
            )
            .await?;

        let outcome = lock_slot(&outcome_slot)
            .take()
            .unwrap_or(CompletionOutcome::Stale { current_job: None });
        match &outcome {
            CompletionOutcome::Applied { .. } => {
                info!(dataset_id = %dataset_id, job_id = %job_id, expires_at = %expires_at, "archive completed");
            }
            CompletionOutcome::Stale { current_job } => {
                warn!(dataset_id = %dataset_id, job_id = %job_id, current_job = ?current_job, "completion ignored for superseded job");
            }
        }
        Ok(outcome)
    }

    /// Records a failed run. Location fields left by an earlier successful run
    /// are kept.
    pub async fn mark_failed(
        &self,
        dataset_id: &str,
        job_id: JobId,
        error: &str,
    ) -> Result<ArchiveRecord> {
        let message = error.to_string();
        let archive = self
            .store
            .update_archive(
                dataset_id,
                Box::new(move |archive| {
                    if !owns_record(archive, job_id) {
                        return;
                    }
                    archive.status = ArchiveStatus::Failed;
                    archive.job_id = Some(job_id);
                    archive.metadata.error = Some(message);
                }),
            )
            .await?;
        warn!(dataset_id = %dataset_id, job_id = %job_id, error = %error, "archive failed");
        Ok(archive)
    }

    pub async fn record_download(&self, dataset_id: &str) -> Result<ArchiveRecord> {
        let now = time::now();
        self.store
            .update_archive(
                dataset_id,
                Box::new(move |archive| {
                    archive.download_count = archive.download_count.saturating_add(1);
                    archive.last_downloaded = Some(now);
                }),
            )
            .await
    }
}

fn owns_record(archive: &ArchiveRecord, job_id: JobId) -> bool {
    archive.job_id.is_none_or(|current| current == job_id)
}

fn lock_slot<T>(slot: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use archivist_common::types::{
        ArchiveOutput, ArchiveRecord, ArchiveStatus, DatasetRecord, JobId,
    };
    use chrono::{Duration, Utc};

    use super::{CompletionOutcome, StatusTracker};
    use crate::store::{DatasetStore, MemoryDatasetStore};

    fn output(key: &str) -> ArchiveOutput {
        ArchiveOutput {
            url: format!("local://archives/{key}"),
            object_key: key.to_string(),
            file_name: key.to_string(),
            size_bytes: 3 * 1024 * 1024,
            etag: "abc-1".to_string(),
            processing_time_ms: 1200,
            total_files: 5,
            successful_conversions: 5,
        }
    }

    async fn tracker_with(archive: ArchiveRecord) -> (StatusTracker, Arc<MemoryDatasetStore>) {
        let store = Arc::new(MemoryDatasetStore::new());
        store
            .put(DatasetRecord {
                dataset_id: "study-1".to_string(),
                archive,
                ..DatasetRecord::default()
            })
            .await
            .unwrap();
        (StatusTracker::new(store.clone(), Duration::days(30)), store)
    }

    #[tokio::test]
    async fn completion_populates_location_and_expiry() {
        let (tracker, store) = tracker_with(ArchiveRecord::default()).await;
        tracker.mark_processing("study-1", JobId(1), 5, 2).await.unwrap();
        let outcome = tracker
            .mark_completed("study-1", JobId(1), &output("a.zip"))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Applied { superseded_key: None });

        let archive = store.get("study-1").await.unwrap().unwrap().archive;
        assert_eq!(archive.status, ArchiveStatus::Completed);
        assert_eq!(archive.size_mb, Some(3.0));
        assert_eq!(archive.metadata.instance_count, 5);
        assert_eq!(archive.metadata.processing_time_ms, Some(1200));
        let retention = archive.expires_at.unwrap() - archive.created_at.unwrap();
        assert_eq!(retention, Duration::days(30));
    }

    #[tokio::test]
    async fn failure_keeps_previous_location() {
        let previous = ArchiveRecord {
            status: ArchiveStatus::Completed,
            url: Some("local://archives/old.zip".to_string()),
            file_name: Some("old.zip".to_string()),
            size_mb: Some(1.0),
            object_key: Some("old.zip".to_string()),
            expires_at: Some(Utc::now() + Duration::days(3)),
            ..ArchiveRecord::default()
        };
        let (tracker, _) = tracker_with(previous).await;
        tracker.mark_processing("study-1", JobId(2), 5, 2).await.unwrap();
        let archive = tracker
            .mark_failed("study-1", JobId(2), "dataset export timed out after 600s")
            .await
            .unwrap();

        assert_eq!(archive.status, ArchiveStatus::Failed);
        assert_eq!(archive.url.as_deref(), Some("local://archives/old.zip"));
        assert_eq!(
            archive.metadata.error.as_deref(),
            Some("dataset export timed out after 600s")
        );
    }

    #[tokio::test]
    async fn replacing_archive_reports_superseded_key() {
        let (tracker, _) = tracker_with(ArchiveRecord::default()).await;
        tracker.mark_processing("study-1", JobId(1), 5, 2).await.unwrap();
        tracker
            .mark_completed("study-1", JobId(1), &output("a.zip"))
            .await
            .unwrap();
        tracker.mark_processing("study-1", JobId(2), 5, 2).await.unwrap();
        let outcome = tracker
            .mark_completed("study-1", JobId(2), &output("b.zip"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Applied {
                superseded_key: Some("a.zip".to_string())
            }
        );
    }

    #[tokio::test]
    async fn superseded_job_cannot_overwrite_record() {
        let (tracker, store) = tracker_with(ArchiveRecord::default()).await;
        tracker.mark_processing("study-1", JobId(1), 5, 2).await.unwrap();
        tracker.mark_processing("study-1", JobId(2), 5, 2).await.unwrap();

        let outcome = tracker
            .mark_completed("study-1", JobId(1), &output("a.zip"))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Stale { current_job: Some(JobId(2)) });
        let archive = store.get("study-1").await.unwrap().unwrap().archive;
        assert_eq!(archive.status, ArchiveStatus::Processing);
        assert!(archive.url.is_none());
    }

    #[tokio::test]
    async fn queued_claim_does_not_overwrite_finished_worker() {
        let (tracker, _) = tracker_with(ArchiveRecord::default()).await;
        tracker.mark_processing("study-1", JobId(3), 5, 2).await.unwrap();
        tracker
            .mark_completed("study-1", JobId(3), &output("a.zip"))
            .await
            .unwrap();

        let archive = tracker.mark_queued("study-1", JobId(3), 5, 2).await.unwrap();
        assert_eq!(archive.status, ArchiveStatus::Completed);

        let archive = tracker.mark_queued("study-1", JobId(4), 5, 2).await.unwrap();
        assert_eq!(archive.status, ArchiveStatus::Processing);
        assert_eq!(archive.job_id, Some(JobId(4)));
        assert_eq!(archive.url.as_deref(), Some("local://archives/a.zip"));
    }

    #[tokio::test]
    async fn downloads_are_counted() {
        let (tracker, _) = tracker_with(ArchiveRecord::default()).await;
        tracker.record_download("study-1").await.unwrap();
        let archive = tracker.record_download("study-1").await.unwrap();
        assert_eq!(archive.download_count, 2);
        assert!(archive.last_downloaded.is_some());
    }
}
