use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn parse(status: String) -> Result<JobStatus, String> {
        match status.as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl AsRef<str> for JobStatus {
    fn as_ref(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Options controlling retries and scheduling of one job.
#[derive(Debug, Clone)]
pub struct JobOpts {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: i32,
    /// Earliest time the job may run. `None` means as soon as possible.
    pub run_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl Default for JobOpts {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            run_at: None,
            tags: Vec::new(),
        }
    }
}

/// A queued job as stored by any [`QueueProvider`](super::QueueProvider).
/// Fields map one to one to the `queue_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobEntry {
    pub fn new(
        job_type: &str,
        payload: serde_json::Value,
        opts: &JobOpts,
        now: DateTime<Utc>,
    ) -> JobEntry {
        JobEntry {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: opts.max_attempts,
            run_at: opts.run_at.unwrap_or(now),
            tags: opts.tags.clone(),
            last_error: None,
            locked_at: None,
            locked_by: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// A `running` entry whose lock was taken before `stale_before`: its worker
    /// died or hung mid-job.
    pub fn is_abandoned(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && matches!(self.locked_at, Some(locked_at) if locked_at < stale_before)
    }

    /// Due pending entries, plus abandoned ones with attempts left.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        self.is_due(now)
            || (self.is_abandoned(stale_before) && self.attempts < self.max_attempts)
    }
}
