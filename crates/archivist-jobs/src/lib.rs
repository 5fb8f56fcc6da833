pub mod job;
pub mod scheduler;
pub mod store;

pub use job::{Job, JobPayload, JobStatus};
pub use scheduler::{JobHandler, JobProgress, JobScheduler, SchedulerConfig};
pub use store::{JobStore, MemoryJobStore};
