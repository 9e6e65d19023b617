use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::entry::{JobEntry, JobStatus};
use super::registry::JobRegistry;
use super::traits::QueueProvider;
use super::JobError;

const MAX_BACKOFF_SECONDS: i64 = 300;
const DEFAULT_LOCK_TIMEOUT_SECONDS: i64 = 600;

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { run_at: DateTime<Utc> },
    Failed,
}

/// Polls a [`QueueProvider`] and dispatches claimed entries to the handlers of a
/// [`JobRegistry`].
///
/// On failure the entry goes back to `pending` with an exponential backoff
/// until `max_attempts` is reached; then it is marked `failed` for good.
/// A job still `running` once its lock is older than `lock_timeout` is taken
/// over by the next poll.
pub struct Worker<Q: QueueProvider, C: Send + Sync + 'static> {
    queue: Q,
    registry: Arc<JobRegistry<C>>,
    ctx: Arc<C>,
    concurrency: usize,
    poll_interval: Duration,
    lock_timeout: chrono::Duration,
    worker_id: String,
}

impl<Q: QueueProvider, C: Send + Sync + 'static> Worker<Q, C> {
    pub fn new(queue: Q, registry: JobRegistry<C>, ctx: Arc<C>) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            ctx,
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            lock_timeout: chrono::Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECONDS),
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Maximum number of jobs processed in parallel (default: 4).
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// How often to poll when idle (default: 1s).
    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    /// Age after which the lock of a `running` job is considered abandoned
    /// (default: 10 minutes). Must exceed the longest job run.
    pub fn lock_timeout(mut self, d: chrono::Duration) -> Self {
        self.lock_timeout = d;
        self
    }

    /// Claim and execute a single due job in the current task.
    pub async fn process_next(&self, now: DateTime<Utc>) -> Result<Option<JobOutcome>, JobError> {
        let Some(entry) = self
            .queue
            .claim_next(&self.worker_id, now, now - self.lock_timeout)
            .await?
        else {
            return Ok(None);
        };

        let outcome = execute(&self.queue, &self.registry, self.ctx.clone(), entry, now).await;

        Ok(Some(outcome))
    }

    /// Spawn the polling loop on the tokio runtime.
    pub fn start(self) -> JoinHandle<()> {
        let Worker {
            queue,
            registry,
            ctx,
            concurrency,
            poll_interval,
            lock_timeout,
            worker_id,
        } = self;

        tracing::info!(%worker_id, concurrency, "starting queue worker");

        tokio::spawn(async move {
            let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
            let mut idle_streak: u32 = 0;

            loop {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };

                let now = Utc::now();
                let entry = match queue.claim_next(&worker_id, now, now - lock_timeout).await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => {
                        drop(permit);
                        idle_streak = idle_streak.saturating_add(1);
                        let backoff =
                            poll_interval.mul_f64((1.5_f64).min(1.0 + idle_streak as f64 * 0.1));
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    Err(e) => {
                        drop(permit);
                        tracing::error!(error = %e, "failed to poll queue");
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                };

                idle_streak = 0;

                let queue = queue.clone();
                let registry = registry.clone();
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    execute(&queue, &registry, ctx, entry, Utc::now()).await;
                });
            }
        })
    }
}

/// Seconds to wait before the next attempt: `2^attempts`, capped at five minutes.
pub fn retry_backoff(attempts: i32) -> chrono::Duration {
    let exponent = attempts.clamp(0, 16) as u32;
    let seconds = 2_i64.saturating_pow(exponent).min(MAX_BACKOFF_SECONDS);

    chrono::Duration::seconds(seconds)
}

async fn execute<Q: QueueProvider, C: Send + Sync + 'static>(
    queue: &Q,
    registry: &JobRegistry<C>,
    ctx: Arc<C>,
    mut entry: JobEntry,
    now: DateTime<Utc>,
) -> JobOutcome {
    let job_id = entry.id;
    let job_type = entry.job_type.clone();

    let outcome = match registry.get(&job_type).cloned() {
        None => {
            tracing::error!(%job_id, %job_type, "no handler registered");
            entry.status = JobStatus::Failed;
            entry.last_error = Some(String::from("unknown job type"));
            entry.completed_at = Some(now);
            JobOutcome::Failed
        }
        Some(handler) => {
            let span = tracing::info_span!("job", %job_id, %job_type, attempt = entry.attempts);
            let result = handler(entry.payload.clone(), ctx).instrument(span).await;

            match result {
                Ok(job_result) => {
                    tracing::info!(%job_id, %job_type, result = ?job_result, "job completed");
                    entry.status = JobStatus::Completed;
                    entry.completed_at = Some(now);
                    entry.locked_at = None;
                    entry.locked_by = None;
                    JobOutcome::Completed
                }
                Err(e) => {
                    let error_msg = e.to_string();
                    entry.last_error = Some(error_msg.clone());
                    entry.locked_at = None;
                    entry.locked_by = None;

                    if entry.attempts < entry.max_attempts {
                        let run_at = now + retry_backoff(entry.attempts);
                        entry.status = JobStatus::Pending;
                        entry.run_at = run_at;
                        tracing::warn!(
                            %job_id, %job_type,
                            attempt = entry.attempts,
                            %error_msg,
                            %run_at,
                            "job failed, scheduling retry"
                        );
                        JobOutcome::Retrying { run_at }
                    } else {
                        entry.status = JobStatus::Failed;
                        entry.completed_at = Some(now);
                        tracing::error!(
                            %job_id, %job_type,
                            attempts = entry.attempts,
                            %error_msg,
                            "job permanently failed"
                        );
                        JobOutcome::Failed
                    }
                }
            }
        }
    };

    if let Err(e) = queue.update(&entry).await {
        tracing::error!(%job_id, %job_type, error = %e, "failed to persist job state");
    }

    outcome
}
