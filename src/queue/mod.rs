//! Durable, at-least-once job queue.
//!
//! - [`JobKind`] / [`Job`]: a serializable payload plus its execution logic.
//! - [`JobEntry`]: the stored form of a queued job.
//! - [`QueueProvider`]: storage backend (Postgres table or in-memory).
//! - [`JobRegistry`] and [`Worker`]: claim due entries and run their handlers with
//!   retry and backoff.
//! - [`ticker::every`]: enqueue a job on a fixed interval.

mod entry;
mod registry;
pub mod ticker;
mod traits;
mod worker;

pub use entry::{JobEntry, JobOpts, JobStatus};
pub use registry::JobRegistry;
pub use traits::{Job, JobKind, JobResult, QueueProvider};
pub use worker::{retry_backoff, JobOutcome, Worker};

use chrono::{DateTime, Utc};

use crate::store::StoreError;

/// `last_error` of a job whose worker vanished during its final attempt.
pub const ABANDONED_ERROR: &str = "worker lock expired on the final attempt";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid duration")]
    InvalidDuration,
    #[error("failed to serialize job payload")]
    Json(#[from] serde_json::Error),
    #[error("queue storage error")]
    Storage(#[from] StoreError),
}

/// Serialize a job into a [`JobEntry`] with explicit options.
pub fn into_entry_with<J: JobKind>(
    job: &J,
    opts: JobOpts,
    now: DateTime<Utc>,
) -> Result<JobEntry, JobError> {
    let payload = serde_json::to_value(job)?;

    Ok(JobEntry::new(J::JOB_TYPE, payload, &opts, now))
}

/// Serialize a job with its default options and insert it into the queue.
pub async fn enqueue<J: JobKind>(
    queue: &impl QueueProvider,
    job: &J,
    now: DateTime<Utc>,
) -> Result<uuid::Uuid, JobError> {
    let entry = into_entry_with(job, J::default_opts(), now)?;
    let id = entry.id;
    queue.insert(&entry).await?;
    Ok(id)
}
