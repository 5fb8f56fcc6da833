use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use archivist_common::{
    error::{ArchivistError, Result},
    types::{ArchiveOutput, JobId},
};
use async_trait::async_trait;
use tokio::{
    sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    job::{Job, JobPayload, JobStatus},
    store::JobStore,
};

pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs active at once.
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Work executed for each dispatched job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job, progress: JobProgress) -> Result<ArchiveOutput>;
}

/// Advisory progress sink handed to the worker that owns a job.
#[derive(Clone)]
pub struct JobProgress {
    store: Arc<dyn JobStore>,
    id: JobId,
}

impl JobProgress {
    pub fn new(store: Arc<dyn JobStore>, id: JobId) -> Self {
        Self { store, id }
    }

    pub fn job_id(&self) -> JobId {
        self.id
    }

    /// Raises the job's progress to `percent`. Lower values and reports for
    /// jobs that are no longer active are ignored.
    pub async fn report(&self, percent: u8) {
        let result: Result<()> = async {
            let Some(mut job) = self.store.get(self.id).await? else {
                return Ok(());
            };
            let percent = percent.min(100);
            if job.status != JobStatus::Active || percent <= job.progress {
                return Ok(());
            }
            job.progress = percent;
            self.store.set(job).await
        }
        .await;

        if let Err(err) = result {
            warn!(job_id = %self.id, error = %err, "failed to record job progress");
        }
    }
}

#[derive(Default)]
struct Queue {
    last_id: u64,
    waiting: VecDeque<JobId>,
    /// Popped from `waiting` and not yet finished.
    running: HashSet<JobId>,
}

struct SchedulerInner {
    store: Arc<dyn JobStore>,
    queue: Mutex<Queue>,
    work: Notify,
    slots: Arc<Semaphore>,
    concurrency: usize,
    active: AtomicUsize,
}

/// FIFO job scheduler with a fixed concurrency ceiling. The dispatcher waits
/// for a free slot on the semaphore and for submitted work on the notifier.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                queue: Mutex::new(Queue::default()),
                work: Notify::new(),
                slots: Arc::new(Semaphore::new(concurrency)),
                concurrency,
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store)
    }

    pub async fn submit(&self, payload: JobPayload) -> Result<Job> {
        // Id allocation and enqueue happen under one lock so queue order is id order.
        let mut queue = self.inner.queue.lock().await;
        let id = JobId(queue.last_id + 1);
        let job = Job::new(id, payload);
        self.inner.store.set(job.clone()).await?;
        queue.last_id = id.0;
        queue.waiting.push_back(id);
        drop(queue);

        self.inner.work.notify_one();
        info!(job_id = %id, dataset_id = %job.payload.dataset_id, "job submitted");
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(ArchivistError::JobNotFound(id.0))
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = self.inner.store.list().await?;
        jobs.sort_by(|left, right| right.id.cmp(&left.id));
        Ok(jobs)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn waiting_count(&self) -> usize {
        self.inner.queue.lock().await.waiting.len()
    }

    /// True while `id` is queued or running in this scheduler. A stored job
    /// that is not live will never make progress.
    pub async fn is_live(&self, id: JobId) -> bool {
        let queue = self.inner.queue.lock().await;
        queue.running.contains(&id) || queue.waiting.contains(&id)
    }

    /// Spawns the dispatcher. Call once per scheduler.
    pub fn start(&self, handler: Arc<dyn JobHandler>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.dispatch_loop(handler).await;
        })
    }

    async fn dispatch_loop(&self, handler: Arc<dyn JobHandler>) {
        loop {
            let Ok(permit) = Arc::clone(&self.inner.slots).acquire_owned().await else {
                warn!("job scheduler slots closed, dispatcher stopping");
                return;
            };
            let id = self.next_waiting().await;
            match self.activate(id).await {
                Ok(job) => self.spawn_worker(job, Arc::clone(&handler), permit),
                Err(err) => self.abandon(id, err).await,
            }
        }
    }

    async fn next_waiting(&self) -> JobId {
        loop {
            let notified = self.inner.work.notified();
            {
                let mut queue = self.inner.queue.lock().await;
                if let Some(id) = queue.waiting.pop_front() {
                    queue.running.insert(id);
                    return id;
                }
            }
            notified.await;
        }
    }

    async fn activate(&self, id: JobId) -> Result<Job> {
        let mut job = self.get_job(id).await?;
        job.activate()?;
        self.inner.store.set(job.clone()).await?;
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(job_id = %id, active, concurrency = self.inner.concurrency, "job dispatched");
        Ok(job)
    }

    fn spawn_worker(&self, job: Job, handler: Arc<dyn JobHandler>, permit: OwnedSemaphorePermit) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let id = job.id;
            let progress = JobProgress::new(scheduler.store(), id);
            // A panicking handler surfaces as a join error and still fails the job.
            let outcome = match tokio::spawn(async move { handler.run(&job, progress).await }).await
            {
                Ok(outcome) => outcome,
                Err(err) => Err(ArchivistError::InternalError(format!(
                    "job worker aborted: {err}"
                ))),
            };
            scheduler.finish(id, outcome).await;
            drop(permit);
        });
    }

    async fn finish(&self, id: JobId, outcome: Result<ArchiveOutput>) {
        match &outcome {
            Ok(output) => {
                info!(job_id = %id, object_key = %output.object_key, "job completed");
            }
            Err(err) => warn!(job_id = %id, error = %err, "job failed"),
        }

        let result: Result<()> = async {
            let mut job = self.get_job(id).await?;
            match outcome {
                Ok(output) => job.complete(output)?,
                Err(err) => job.fail(err.to_string())?,
            }
            self.inner.store.set(job).await
        }
        .await;
        if let Err(err) = result {
            warn!(job_id = %id, error = %err, "failed to record job outcome");
        }

        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.queue.lock().await.running.remove(&id);
    }

    /// Fails a job that was popped from the queue but could not be activated.
    async fn abandon(&self, id: JobId, cause: ArchivistError) {
        warn!(job_id = %id, error = %cause, "failed to dispatch job");
        self.inner.queue.lock().await.running.remove(&id);
        let result: Result<()> = async {
            let mut job = self.get_job(id).await?;
            job.fail(format!("job could not be dispatched: {cause}"))?;
            self.inner.store.set(job).await
        }
        .await;
        if let Err(err) = result {
            warn!(job_id = %id, error = %err, "failed to record dispatch failure");
        }
    }
}
