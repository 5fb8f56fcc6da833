use std::{collections::HashMap, sync::Arc};

use archivist_common::{
    error::{ArchivistError, Result},
    time,
    types::{ArchiveStatus, DatasetRecord, JobId},
};
use archivist_dataset::{DatasetStore, StatusTracker};
use archivist_jobs::{JobPayload, JobScheduler, JobStatus};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::signer::LinkSigner;

#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    Available {
        url: String,
        file_name: Option<String>,
        size_mb: Option<f64>,
        expires_at: Option<DateTime<Utc>>,
    },
    Processing {
        job_id: Option<JobId>,
    },
    Failed {
        error: String,
    },
    Expired,
    NotAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    /// True when an in-flight job was returned instead of submitting one.
    pub existing: bool,
}

/// Read path for archives and the only sanctioned way to start one.
pub struct ArchiveGateway {
    datasets: Arc<dyn DatasetStore>,
    tracker: StatusTracker,
    scheduler: JobScheduler,
    signer: LinkSigner,
    create_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArchiveGateway {
    pub fn new(tracker: StatusTracker, scheduler: JobScheduler, signer: LinkSigner) -> Self {
        Self {
            datasets: tracker.store(),
            tracker,
            scheduler,
            signer,
            create_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, dataset_id: &str) -> Result<Retrieval> {
        let Some(record) = self.datasets.get(dataset_id).await? else {
            return Ok(Retrieval::NotAvailable);
        };
        let archive = record.archive;

        let retrieval = match archive.status {
            ArchiveStatus::Completed if archive.is_past_expiry(time::now()) => Retrieval::Expired,
            ArchiveStatus::Completed => {
                let url = match (&archive.object_key, &archive.url) {
                    (Some(key), _) => self.signer.sign(key)?.url,
                    (None, Some(url)) => url.clone(),
                    (None, None) => {
                        return Err(ArchivistError::InternalError(format!(
                            "completed archive for {dataset_id} has no location"
                        )));
                    }
                };
                if let Err(err) = self.tracker.record_download(dataset_id).await {
                    warn!(dataset_id = %dataset_id, error = %err, "failed to record archive download");
                }
                Retrieval::Available {
                    url,
                    file_name: archive.file_name,
                    size_mb: archive.size_mb,
                    expires_at: archive.expires_at,
                }
            }
            ArchiveStatus::Processing => Retrieval::Processing {
                job_id: archive.job_id,
            },
            ArchiveStatus::Failed => Retrieval::Failed {
                error: archive
                    .metadata
                    .error
                    .unwrap_or_else(|| "archive creation failed".to_string()),
            },
            ArchiveStatus::Expired => Retrieval::Expired,
            ArchiveStatus::NotStarted => Retrieval::NotAvailable,
        };
        Ok(retrieval)
    }

    /// Starts an archive job for `dataset_id`, or returns the one already in
    /// flight. Calls for the same dataset are serialised.
    pub async fn create(&self, dataset_id: &str) -> Result<CreateOutcome> {
        let lock = self.create_lock(dataset_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.create_locked(dataset_id).await
        };
        self.release_create_lock(dataset_id, lock).await;
        outcome
    }

    async fn create_locked(&self, dataset_id: &str) -> Result<CreateOutcome> {
        let record = self
            .datasets
            .get(dataset_id)
            .await?
            .ok_or_else(|| ArchivistError::RecordNotFound(dataset_id.to_string()))?;

        if let Some(existing) = self.in_flight(&record).await? {
            debug!(dataset_id = %dataset_id, job_id = %existing.job_id, "archive already in flight");
            return Ok(existing);
        }

        let job = self
            .scheduler
            .submit(JobPayload {
                dataset_id: record.dataset_id.clone(),
                dataset_record_ref: format!("datasets/{}", record.dataset_id),
                instance_count: record.instance_count,
                series_count: record.series_count,
            })
            .await?;
        self.tracker
            .mark_queued(dataset_id, job.id, record.instance_count, record.series_count)
            .await?;
        info!(dataset_id = %dataset_id, job_id = %job.id, "archive creation requested");

        Ok(CreateOutcome {
            job_id: job.id,
            status: job.status,
            existing: false,
        })
    }

    /// A processing record whose job is unknown, finished, or no longer held
    /// by the scheduler (for example after a restart) does not count as in
    /// flight.
    async fn in_flight(&self, record: &DatasetRecord) -> Result<Option<CreateOutcome>> {
        if record.archive.status != ArchiveStatus::Processing {
            return Ok(None);
        }
        let Some(job_id) = record.archive.job_id else {
            return Ok(None);
        };
        let live = self.scheduler.is_live(job_id).await;
        match self.scheduler.get_job(job_id).await {
            Ok(job) if live && !job.status.is_terminal() => Ok(Some(CreateOutcome {
                job_id,
                status: job.status,
                existing: true,
            })),
            Ok(_) | Err(ArchivistError::JobNotFound(_)) => {
                warn!(dataset_id = %record.dataset_id, job_id = %job_id, "processing record has no live job, resubmitting");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn create_lock(&self, dataset_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.create_locks.lock().await;
        Arc::clone(locks.entry(dataset_id.to_string()).or_default())
    }

    async fn release_create_lock(&self, dataset_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.create_locks.lock().await;
        // One reference in the map plus ours means nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(dataset_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use archivist_common::types::{ArchiveRecord, ArchiveStatus, DatasetRecord, JobId};
    use archivist_dataset::{DatasetStore, MemoryDatasetStore, StatusTracker};
    use archivist_jobs::{
        Job, JobPayload, JobScheduler, JobStatus, JobStore, MemoryJobStore, SchedulerConfig,
    };
    use chrono::Utc;

    use super::{ArchiveGateway, Retrieval};
    use crate::signer::{LinkSigner, LinkSignerConfig};

    async fn gateway(archive: ArchiveRecord) -> (Arc<ArchiveGateway>, Arc<MemoryDatasetStore>, JobScheduler) {
        let store = Arc::new(MemoryDatasetStore::new());
        store
            .put(DatasetRecord {
                dataset_id: "study-1".to_string(),
                instance_count: 5,
                series_count: 2,
                archive,
                ..DatasetRecord::default()
            })
            .await
            .unwrap();
        // The scheduler is never started, so submitted jobs stay waiting.
        let scheduler = JobScheduler::new(Arc::new(MemoryJobStore::new()), SchedulerConfig::default());
        let tracker = StatusTracker::new(store.clone(), chrono::Duration::days(30));
        let signer = LinkSigner::new(LinkSignerConfig {
            public_url: "http://archives.test".to_string(),
            ttl: Duration::from_secs(900),
            secret: b"secret".to_vec(),
        });
        (
            Arc::new(ArchiveGateway::new(tracker, scheduler.clone(), signer)),
            store,
            scheduler,
        )
    }

    fn completed(expires_in: chrono::Duration) -> ArchiveRecord {
        ArchiveRecord {
            status: ArchiveStatus::Completed,
            url: Some("local://archives/study-1/a.zip".to_string()),
            file_name: Some("a.zip".to_string()),
            size_mb: Some(2.5),
            object_key: Some("study-1/a.zip".to_string()),
            expires_at: Some(Utc::now() + expires_in),
            ..ArchiveRecord::default()
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_while_processing() {
        let (gateway, store, scheduler) = gateway(ArchiveRecord::default()).await;

        let first = gateway.create("study-1").await.unwrap();
        assert!(!first.existing);
        assert_eq!(first.status, JobStatus::Waiting);
        let archive = store.get("study-1").await.unwrap().unwrap().archive;
        assert_eq!(archive.status, ArchiveStatus::Processing);
        assert_eq!(archive.job_id, Some(first.job_id));

        let second = gateway.create("study-1").await.unwrap();
        assert!(second.existing);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(scheduler.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_submit_one_job() {
        let (gateway, _, scheduler) = gateway(ArchiveRecord::default()).await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move { gateway.create("study-1").await.unwrap() }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().job_id);
        }
        ids.dedup();
        assert_eq!(ids, vec![JobId(1)]);
        assert_eq!(scheduler.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_for_unknown_dataset_is_rejected_before_queueing() {
        let (gateway, _, scheduler) = gateway(ArchiveRecord::default()).await;
        assert!(gateway.create("missing").await.is_err());
        assert!(scheduler.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_processing_record_is_resubmitted() {
        let (gateway, _, _) = gateway(ArchiveRecord {
            status: ArchiveStatus::Processing,
            job_id: Some(JobId(42)),
            ..ArchiveRecord::default()
        })
        .await;
        let outcome = gateway.create("study-1").await.unwrap();
        assert!(!outcome.existing);
        assert_eq!(outcome.job_id, JobId(1));
    }

    #[tokio::test]
    async fn job_stuck_in_store_is_resubmitted() {
        let (gateway, store, scheduler) = gateway(ArchiveRecord {
            status: ArchiveStatus::Processing,
            job_id: Some(JobId(7)),
            ..ArchiveRecord::default()
        })
        .await;
        let mut stuck = Job::new(
            JobId(7),
            JobPayload {
                dataset_id: "study-1".to_string(),
                dataset_record_ref: "datasets/study-1".to_string(),
                instance_count: 5,
                series_count: 2,
            },
        );
        stuck.activate().unwrap();
        scheduler.store().set(stuck).await.unwrap();

        let outcome = gateway.create("study-1").await.unwrap();
        assert!(!outcome.existing);
        assert_ne!(outcome.job_id, JobId(7));
        let archive = store.get("study-1").await.unwrap().unwrap().archive;
        assert_eq!(archive.job_id, Some(outcome.job_id));
    }

    #[tokio::test]
    async fn completed_archive_is_served_with_signed_link() {
        let (gateway, store, _) = gateway(completed(chrono::Duration::days(10))).await;
        let retrieval = gateway.get("study-1").await.unwrap();
        let Retrieval::Available { url, size_mb, .. } = retrieval else {
            panic!("expected available archive");
        };
        assert!(url.starts_with("http://archives.test/objects/study-1/a.zip?expires="));
        assert_eq!(size_mb, Some(2.5));

        let archive = store.get("study-1").await.unwrap().unwrap().archive;
        assert_eq!(archive.download_count, 1);
        assert!(archive.last_downloaded.is_some());
    }

    #[tokio::test]
    async fn past_expiry_reports_expired_without_counting() {
        let (gateway, store, _) = gateway(completed(chrono::Duration::days(-1))).await;
        assert_eq!(gateway.get("study-1").await.unwrap(), Retrieval::Expired);
        let archive = store.get("study-1").await.unwrap().unwrap().archive;
        assert_eq!(archive.download_count, 0);
    }

    #[tokio::test]
    async fn other_states_are_reported() {
        let (gateway, _, _) = gateway(ArchiveRecord {
            status: ArchiveStatus::Failed,
            ..ArchiveRecord::default()
        })
        .await;
        assert!(matches!(gateway.get("study-1").await.unwrap(), Retrieval::Failed { .. }));
        assert_eq!(gateway.get("unknown").await.unwrap(), Retrieval::NotAvailable);
    }
}
