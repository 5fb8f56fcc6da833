use std::collections::HashMap;

use archivist_common::{
    error::{ArchivistError, Result},
    time,
    types::{ArchiveOutput, DatasetRecord},
};
use archivist_dataset::{CompletionOutcome, StatusTracker};
use archivist_jobs::{Job, JobHandler, JobProgress};
use archivist_storage::ArchiveUploader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{assembler::ArchiveAssembler, naming::archive_object_key};

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Share of job progress covered by assembly; upload covers the rest.
const ASSEMBLY_SHARE: u8 = 50;

/// Job handler that runs assembly, upload and status tracking for one dataset.
pub struct ArchivePipeline {
    assembler: ArchiveAssembler,
    uploader: ArchiveUploader,
    tracker: StatusTracker,
}

impl ArchivePipeline {
    pub fn new(assembler: ArchiveAssembler, uploader: ArchiveUploader, tracker: StatusTracker) -> Self {
        Self {
            assembler,
            uploader,
            tracker,
        }
    }

    async fn build(&self, job: &Job, progress: &watch::Sender<u8>) -> Result<ArchiveOutput> {
        let started = time::now();
        let dataset_id = job.payload.dataset_id.as_str();
        let dataset = self
            .tracker
            .store()
            .get(dataset_id)
            .await?
            .ok_or_else(|| ArchivistError::RecordNotFound(dataset_id.to_string()))?;

        let archive = self
            .assembler
            .assemble(&dataset, &|done, total| {
                progress.send_replace(scale(done as u64, total as u64, 0, ASSEMBLY_SHARE));
            })
            .await?;
        progress.send_replace(ASSEMBLY_SHARE);

        let key = archive_object_key(dataset_id, &archive.file_name);
        let uploaded = self
            .uploader
            .upload_file(
                archive.path(),
                &key,
                ARCHIVE_CONTENT_TYPE,
                archive_tags(&dataset, job, started),
                &|sent, total| {
                    progress.send_replace(scale(sent, total, ASSEMBLY_SHARE, 100));
                },
            )
            .await?;

        Ok(ArchiveOutput {
            url: uploaded.location,
            object_key: uploaded.key,
            file_name: archive.file_name.clone(),
            size_bytes: uploaded.size,
            etag: uploaded.etag,
            processing_time_ms: time::elapsed_millis(started),
            total_files: archive.total_files,
            successful_conversions: archive.successful_conversions,
        })
    }

    async fn record_failure(&self, job: &Job, err: &ArchivistError) {
        if let Err(track_err) = self
            .tracker
            .mark_failed(&job.payload.dataset_id, job.id, &err.to_string())
            .await
        {
            warn!(job_id = %job.id, error = %track_err, "failed to record archive failure");
        }
    }

    /// Best-effort removal of an object no record points at.
    async fn discard(&self, dataset_id: &str, key: &str) {
        let object_layer = self.uploader.object_layer();
        match object_layer.delete_object(self.uploader.bucket(), key).await {
            Ok(()) => info!(dataset_id = %dataset_id, object_key = %key, "unreferenced archive deleted"),
            Err(ArchivistError::ObjectNotFound { .. }) => {}
            Err(err) => {
                warn!(dataset_id = %dataset_id, object_key = %key, error = %err, "failed to delete unreferenced archive");
            }
        }
    }
}

#[async_trait]
impl JobHandler for ArchivePipeline {
    async fn run(&self, job: &Job, progress: JobProgress) -> Result<ArchiveOutput> {
        let dataset_id = job.payload.dataset_id.as_str();
        self.tracker
            .mark_processing(
                dataset_id,
                job.id,
                job.payload.instance_count,
                job.payload.series_count,
            )
            .await?;

        let (sender, receiver) = watch::channel(0u8);
        let forwarder = tokio::spawn(forward_progress(receiver, progress));
        let built = self.build(job, &sender).await;
        drop(sender);
        // Progress writes must land before the scheduler records the terminal state.
        if let Err(err) = forwarder.await {
            warn!(job_id = %job.id, error = %err, "progress forwarder aborted");
        }

        let output = match built {
            Ok(output) => output,
            Err(err) => {
                self.record_failure(job, &err).await;
                return Err(err);
            }
        };

        match self.tracker.mark_completed(dataset_id, job.id, &output).await {
            Ok(CompletionOutcome::Applied { superseded_key }) => {
                if let Some(previous) = superseded_key {
                    self.discard(dataset_id, &previous).await;
                }
                Ok(output)
            }
            Ok(CompletionOutcome::Stale { current_job }) => {
                self.discard(dataset_id, &output.object_key).await;
                let owner = current_job.map_or_else(|| "none".to_string(), |id| id.to_string());
                Err(ArchivistError::InternalError(format!(
                    "dataset {dataset_id} was taken over by job {owner}"
                )))
            }
            Err(err) => {
                self.discard(dataset_id, &output.object_key).await;
                self.record_failure(job, &err).await;
                Err(err)
            }
        }
    }
}

async fn forward_progress(mut receiver: watch::Receiver<u8>, progress: JobProgress) {
    while receiver.changed().await.is_ok() {
        let percent = *receiver.borrow_and_update();
        progress.report(percent).await;
    }
}

fn scale(done: u64, total: u64, from: u8, to: u8) -> u8 {
    if total == 0 {
        return to;
    }
    let span = u64::from(to.saturating_sub(from));
    let offset = (done.min(total) * span) / total;
    from.saturating_add(offset as u8)
}

fn archive_tags(dataset: &DatasetRecord, job: &Job, created_at: DateTime<Utc>) -> HashMap<String, String> {
    HashMap::from([
        ("dataset-id".to_string(), dataset.dataset_id.clone()),
        ("patient-id".to_string(), dataset.patient_id.clone()),
        ("study-instance-uid".to_string(), dataset.study_instance_uid.clone()),
        ("job-id".to_string(), job.id.to_string()),
        ("created-at".to_string(), created_at.to_rfc3339()),
    ])
}
