use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use super::entry::{JobEntry, JobOpts};
use super::JobError;

/// Convenience alias for the return type of [`Job::perform`].
pub type JobResult = Result<Option<serde_json::Value>, Box<dyn std::error::Error + Send + Sync>>;

/// The serialized half of a job: its fields are the payload.
pub trait JobKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier stored in the `job_type` column.
    const JOB_TYPE: &'static str;

    fn default_opts() -> JobOpts {
        JobOpts::default()
    }
}

/// A unit of work executed by a [`Worker`](super::Worker) with state `C`.
#[async_trait]
pub trait Job<C: Send + Sync + 'static>: JobKind {
    /// Return `Ok(Some(value))` to leave a result in the logs.
    async fn perform(self, ctx: &C) -> JobResult;
}

/// Storage backing the durable queue.
///
/// The [`Worker`](super::Worker) owns every status transition (retry, completion,
/// permanent failure) and writes the modified entry back through `update`.
#[async_trait]
pub trait QueueProvider: Send + Sync + Clone + 'static {
    async fn insert(&self, entry: &JobEntry) -> Result<(), JobError>;

    /// Atomically claim the oldest pending job with `run_at <= now`: mark it
    /// `running`, stamp the lock columns and bump `attempts`.
    ///
    /// A `running` job locked before `stale_before` was abandoned by its worker.
    /// It is claimed again while it has attempts left, otherwise it is marked
    /// `failed`.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<JobEntry>, JobError>;

    async fn update(&self, entry: &JobEntry) -> Result<(), JobError>;
}
