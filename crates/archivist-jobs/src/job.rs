use archivist_common::{
    error::{ArchivistError, Result},
    time,
    types::{ArchiveOutput, JobId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status only moves forward: waiting -> active -> completed | failed. A
    /// job that could not be dispatched fails straight from waiting.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Active)
                | (Self::Waiting, Self::Failed)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub dataset_id: String,
    pub dataset_record_ref: String,
    pub instance_count: u32,
    pub series_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ArchiveOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: JobId, payload: JobPayload) -> Self {
        Self {
            id,
            payload,
            status: JobStatus::Waiting,
            created_at: time::now(),
            started_at: None,
            finished_at: None,
            progress: 0,
            result: None,
            error: None,
        }
    }

    pub fn activate(&mut self) -> Result<()> {
        self.transition(JobStatus::Active)?;
        self.started_at = Some(time::now());
        Ok(())
    }

    pub fn complete(&mut self, output: ArchiveOutput) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.finished_at = Some(time::now());
        self.progress = 100;
        self.result = Some(output);
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, message: String) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.finished_at = Some(time::now());
        self.result = None;
        self.error = Some(message);
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ArchivistError::InternalError(format!(
                "job {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use archivist_common::types::{ArchiveOutput, JobId};

    use super::{Job, JobPayload, JobStatus};

    fn job() -> Job {
        Job::new(
            JobId(7),
            JobPayload {
                dataset_id: "study-1".to_string(),
                dataset_record_ref: "datasets/study-1".to_string(),
                instance_count: 5,
                series_count: 2,
            },
        )
    }

    #[test]
    fn status_never_regresses() {
        let mut job = job();
        assert!(job.complete(output()).is_err());
        job.activate().unwrap();
        assert!(job.activate().is_err());
        job.fail("dataset export timed out after 600s".to_string()).unwrap();
        assert!(job.complete(output()).is_err());
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
    }

    #[test]
    fn waiting_job_can_fail_without_starting() {
        let mut job = job();
        job.fail("job could not be dispatched".to_string()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_none());
        assert!(job.activate().is_err());
    }

    #[test]
    fn completed_job_carries_result_only() {
        let mut job = job();
        job.activate().unwrap();
        job.complete(output()).unwrap();
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
        assert!(job.error.is_none());

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["payload"]["datasetId"], "study-1");
        assert!(value.get("error").is_none());
    }

    fn output() -> ArchiveOutput {
        ArchiveOutput {
            url: "local://archives/a.zip".to_string(),
            object_key: "a.zip".to_string(),
            file_name: "a.zip".to_string(),
            size_bytes: 10,
            etag: "etag".to_string(),
            processing_time_ms: 5,
            total_files: 1,
            successful_conversions: 1,
        }
    }
}
