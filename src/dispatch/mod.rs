//! Turning released newsletters into scheduled per-recipient email jobs.

pub mod jobs;
pub mod schedule;
pub mod scheduler;
pub mod unsubscribe;

pub use jobs::{DispatchContext, MarketingEmailJob, NewsletterProcessingJob};
pub use scheduler::{DispatchScheduler, PassReport};
pub use unsubscribe::{build_unsubscribe_link, unsubscribe, UnsubscribeError};

use chrono::Duration;
use uuid::Uuid;

use crate::queue::JobError;
use crate::store::StoreError;

/// Tunables of a scheduler pass.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// `From` header of newsletter emails.
    pub sender: String,
    /// Public base URL unsubscribe links point at.
    pub base_url: String,
    /// Emails scheduled per send day, across all newsletters.
    pub max_daily_emails: usize,
    pub send_start_hour: u32,
    pub send_start_minute: u32,
    pub spacing: Duration,
    pub min_jitter_minutes: i64,
    pub max_jitter_minutes: i64,
    pub unsubscribe_token_ttl: Duration,
    /// Attempts allowed to each email job, the first one included.
    pub max_attempts: i32,
}

impl DispatchPolicy {
    pub fn new(base_url: String, sender: String) -> Self {
        Self {
            sender,
            base_url,
            max_daily_emails: 35,
            send_start_hour: 9,
            send_start_minute: 0,
            spacing: Duration::minutes(2),
            min_jitter_minutes: 1,
            max_jitter_minutes: 3,
            unsubscribe_token_ttl: Duration::days(30),
            max_attempts: 5,
        }
    }

    /// Offset from the base send time of the latest email a send day can hold.
    pub fn last_slot_offset(&self) -> Duration {
        let slots = i32::try_from(self.max_daily_emails.saturating_sub(1)).unwrap_or(i32::MAX);
        self.spacing * slots + Duration::minutes(self.min_jitter_minutes.max(self.max_jitter_minutes))
    }

    /// A send day must fit in the 24 hours after its base time, or its quota
    /// would be counted against the next one.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.min_jitter_minutes.min(self.max_jitter_minutes) < 0 {
            return Err(DispatchError::InvalidPolicy(String::from(
                "jitter must not be negative",
            )));
        }
        if self.spacing < Duration::zero() {
            return Err(DispatchError::InvalidPolicy(String::from(
                "spacing must not be negative",
            )));
        }
        if self.last_slot_offset() >= Duration::days(1) {
            return Err(DispatchError::InvalidPolicy(format!(
                "{} emails spaced {} minutes apart do not fit in one day",
                self.max_daily_emails,
                self.spacing.num_minutes()
            )));
        }
        Ok(())
    }
}

#[derive(thiserror::Error)]
pub enum DispatchError {
    #[error("{hour:02}:{minute:02} is not a valid send time.")]
    InvalidSendTime { hour: u32, minute: u32 },
    #[error("Invalid dispatch policy: {0}.")]
    InvalidPolicy(String),
    #[error("Newsletter {0} is no longer ready to send.")]
    NotDispatchable(Uuid),
    #[error("No email could be scheduled for newsletter {0}.")]
    NothingScheduled(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to enqueue an email job.")]
    Queue(#[from] JobError),
}

impl std::fmt::Debug for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::utils::error_chain_fmt(self, f)
    }
}
