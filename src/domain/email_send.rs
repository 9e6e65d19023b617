use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::delivery_status::DeliveryStatus;

/// One delivery ledger row: the send of one newsletter to one subscriber.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NewsletterEmailSend {
    pub id: Uuid,
    pub newsletter_id: Uuid,
    pub subscriber_id: Uuid,
    /// Copied at schedule time so later subscriber changes don't rewrite history.
    pub email_address: String,
    pub status: DeliveryStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub queue_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewEmailSend {
    pub newsletter_id: Uuid,
    pub subscriber_id: Uuid,
    pub email_address: String,
    pub scheduled_at: DateTime<Utc>,
    pub queue_job_id: Uuid,
}

impl NewEmailSend {
    pub fn into_pending(self, now: DateTime<Utc>) -> NewsletterEmailSend {
        NewsletterEmailSend {
            id: Uuid::new_v4(),
            newsletter_id: self.newsletter_id,
            subscriber_id: self.subscriber_id,
            email_address: self.email_address,
            status: DeliveryStatus::Pending,
            scheduled_at: self.scheduled_at,
            sent_at: None,
            failed_at: None,
            error_message: None,
            queue_job_id: Some(self.queue_job_id),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Aggregate view over the ledger rows of one newsletter. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct NewsletterSendStats {
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub bounced: i64,
    pub pending: i64,
    pub completion_rate: f64,
}

impl NewsletterSendStats {
    pub fn from_counts(sent: i64, failed: i64, bounced: i64, pending: i64) -> Self {
        let total = sent + failed + bounced + pending;
        let completion_rate = if total == 0 {
            0.0
        } else {
            sent as f64 / total as f64
        };

        NewsletterSendStats {
            total,
            sent,
            failed,
            bounced,
            pending,
            completion_rate,
        }
    }

    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a DeliveryStatus>) -> Self {
        let (mut sent, mut failed, mut bounced, mut pending) = (0, 0, 0, 0);

        for status in statuses {
            match status {
                DeliveryStatus::Pending => pending += 1,
                DeliveryStatus::Sent => sent += 1,
                DeliveryStatus::Failed => failed += 1,
                DeliveryStatus::Bounced => bounced += 1,
            }
        }

        Self::from_counts(sent, failed, bounced, pending)
    }
}
