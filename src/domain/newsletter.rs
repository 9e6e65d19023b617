use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::send_status::SendStatus;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Newsletter {
    pub id: Uuid,
    pub title: String,
    /// Rendered HTML body.
    pub content: String,
    pub send_status: SendStatus,
    /// Frozen when the newsletter becomes ready to send.
    pub total_recipients: i32,
    /// Recipients whose email has been scheduled so far.
    pub emails_sent: i32,
    pub sending_started_at: Option<DateTime<Utc>>,
    pub sending_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Newsletter {
    pub fn draft(title: &str, content: &str, now: DateTime<Utc>) -> Newsletter {
        Newsletter {
            id: Uuid::new_v4(),
            title: String::from(title),
            content: String::from(content),
            send_status: SendStatus::Draft,
            total_recipients: 0,
            emails_sent: 0,
            sending_started_at: None,
            sending_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recipients that still need an email scheduled.
    pub fn outstanding_recipients(&self) -> usize {
        (self.total_recipients - self.emails_sent).max(0) as usize
    }

    pub fn is_dispatchable(&self) -> bool {
        self.send_status.is_ready_to_send() || self.send_status.is_sending()
    }
}
