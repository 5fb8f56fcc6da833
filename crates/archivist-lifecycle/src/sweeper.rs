use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use archivist_common::{
    error::{ArchivistError, Result},
    time,
    types::ArchiveStatus,
};
use archivist_dataset::DatasetStore;
use archivist_storage::ObjectLayer;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub bucket: String,
    pub interval: Duration,
    /// Consecutive delete failures before a dataset is dead-lettered.
    pub max_attempts: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            bucket: "archives".to_string(),
            interval: Duration::from_secs(60 * 60),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: usize,
    pub expired: usize,
    /// Objects deleted for failed records that still referenced them.
    pub reclaimed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub dataset_id: String,
    pub object_key: String,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Default)]
struct SweepState {
    failures: HashMap<String, u32>,
    dead_letters: BTreeMap<String, DeadLetter>,
}

enum DeleteOutcome {
    Retry,
    DeadLettered,
}

enum Expiry {
    Expired,
    Reclaimed,
    Changed,
}

/// Deletes archives past their retention window and marks their records expired.
pub struct ExpirationSweeper {
    datasets: Arc<dyn DatasetStore>,
    object_layer: Arc<dyn ObjectLayer>,
    config: SweeperConfig,
    state: Mutex<SweepState>,
}

impl ExpirationSweeper {
    pub fn new(
        datasets: Arc<dyn DatasetStore>,
        object_layer: Arc<dyn ObjectLayer>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            datasets,
            object_layer,
            config,
            state: Mutex::new(SweepState::default()),
        }
    }

    pub async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep_once().await {
                warn!(error = %err, "expiration sweep failed");
            }
        }
    }

    /// One pass over every record that still references an archive past its
    /// retention. A failing delete leaves the record untouched for the next pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = time::now();
        let mut report = SweepReport::default();

        for record in self.datasets.list().await? {
            if !record.archive.holds_expired_archive(now) {
                continue;
            }
            report.candidates += 1;
            let dataset_id = record.dataset_id;

            if self.state.lock().await.dead_letters.contains_key(&dataset_id) {
                report.skipped += 1;
                continue;
            }

            let object_key = record.archive.object_key.unwrap_or_default();
            let deleted = if object_key.is_empty() {
                Ok(())
            } else {
                match self
                    .object_layer
                    .delete_object(&self.config.bucket, &object_key)
                    .await
                {
                    Err(ArchivistError::ObjectNotFound { .. }) => Ok(()),
                    other => other,
                }
            };

            if let Err(err) = deleted {
                match self.record_failure(&dataset_id, &object_key, &err).await {
                    DeleteOutcome::Retry => report.failed += 1,
                    DeleteOutcome::DeadLettered => report.dead_lettered += 1,
                }
                continue;
            }

            match self.expire(&dataset_id, &object_key).await {
                Ok(Expiry::Expired) => {
                    self.state.lock().await.failures.remove(&dataset_id);
                    info!(dataset_id = %dataset_id, object_key = %object_key, "archive expired");
                    report.expired += 1;
                }
                Ok(Expiry::Reclaimed) => {
                    self.state.lock().await.failures.remove(&dataset_id);
                    info!(dataset_id = %dataset_id, object_key = %object_key, "expired archive of failed record deleted");
                    report.reclaimed += 1;
                }
                Ok(Expiry::Changed) => {
                    debug!(dataset_id = %dataset_id, "archive record changed during sweep");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(dataset_id = %dataset_id, error = %err, "failed to mark archive expired");
                    report.failed += 1;
                }
            }
        }

        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                expired = report.expired,
                reclaimed = report.reclaimed,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "expiration sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.values().cloned().collect()
    }

    /// Returns a dead-lettered dataset to the sweep with a fresh attempt budget.
    pub async fn clear_dead_letter(&self, dataset_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.failures.remove(dataset_id);
        state.dead_letters.remove(dataset_id).is_some()
    }

    /// Clears the location of a record that still describes the object that
    /// was just deleted. Completed records become expired; failed records stay
    /// failed.
    async fn expire(&self, dataset_id: &str, object_key: &str) -> Result<Expiry> {
        let outcome = Arc::new(std::sync::Mutex::new(Expiry::Changed));
        let slot = Arc::clone(&outcome);
        let expected_key = object_key.to_string();
        self.datasets
            .update_archive(
                dataset_id,
                Box::new(move |archive| {
                    if archive.object_key.as_deref().unwrap_or_default() != expected_key {
                        return;
                    }
                    let applied = match archive.status {
                        ArchiveStatus::Completed => {
                            archive.status = ArchiveStatus::Expired;
                            Expiry::Expired
                        }
                        ArchiveStatus::Failed if archive.object_key.is_some() => Expiry::Reclaimed,
                        _ => return,
                    };
                    archive.clear_location();
                    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = applied;
                }),
            )
            .await?;
        let mut applied = outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(std::mem::replace(&mut *applied, Expiry::Changed))
    }

    async fn record_failure(
        &self,
        dataset_id: &str,
        object_key: &str,
        err: &ArchivistError,
    ) -> DeleteOutcome {
        let mut state = self.state.lock().await;
        let attempts = {
            let count = state.failures.entry(dataset_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if attempts < self.config.max_attempts {
            warn!(
                dataset_id = %dataset_id,
                object_key = %object_key,
                attempts,
                error = %err,
                "failed to delete expired archive, will retry"
            );
            return DeleteOutcome::Retry;
        }

        error!(
            dataset_id = %dataset_id,
            object_key = %object_key,
            attempts,
            error = %err,
            "expired archive could not be deleted, moved to dead letter"
        );
        state.failures.remove(dataset_id);
        state.dead_letters.insert(
            dataset_id.to_string(),
            DeadLetter {
                dataset_id: dataset_id.to_string(),
                object_key: object_key.to_string(),
                attempts,
                last_error: err.to_string(),
            },
        );
        DeleteOutcome::DeadLettered
    }
}
