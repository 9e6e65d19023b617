use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use super::traits::{JobKind, QueueProvider};
use super::{into_entry_with, JobError};

/// Enqueue a fresh copy of `job` every `period`, starting immediately.
///
/// A tick that fails to enqueue is logged and the next tick tries again.
pub fn every<Q, J>(queue: Q, period: Duration, job: J) -> Result<JoinHandle<()>, JobError>
where
    Q: QueueProvider,
    J: JobKind,
{
    if period.is_zero() {
        return Err(JobError::InvalidDuration);
    }

    let job_type = J::JOB_TYPE;
    tracing::info!(%job_type, period_seconds = period.as_secs(), "starting periodic ticker");

    Ok(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let entry = match into_entry_with(&job, J::default_opts(), Utc::now()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(error = %e, %job_type, "failed to serialize periodic job");
                    continue;
                }
            };

            if let Err(e) = queue.insert(&entry).await {
                tracing::error!(error = %e, %job_type, "failed to enqueue periodic job");
            }
        }
    }))
}
