use std::collections::HashMap;

use archivist_common::{error::Result, types::JobId};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::job::Job;

/// Job registry. The scheduler only needs keyed reads, writes and a scan, so a
/// persistent or shared implementation can replace the in-memory one.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: JobId) -> Result<Option<Job>>;
    async fn set(&self, job: Job) -> Result<()>;
    async fn list(&self) -> Result<Vec<Job>>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn set(&self, job: Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}
