use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreError, StoreTransaction, TokenStore};
use crate::domain::delivery_status::DeliveryStatus;
use crate::domain::email_send::{NewEmailSend, NewsletterEmailSend, NewsletterSendStats};
use crate::domain::newsletter::Newsletter;
use crate::domain::send_status::SendStatus;
use crate::domain::subscriber::Subscriber;
use crate::domain::subscriber_email::SubscriberEmail;
use crate::domain::token::{Token, TokenMode};
use crate::queue::{JobEntry, JobError, JobStatus, QueueProvider, ABANDONED_ERROR};

#[derive(Clone, Default)]
struct MemoryState {
    newsletters: Vec<Newsletter>,
    subscribers: Vec<Subscriber>,
    tokens: Vec<Token>,
    email_sends: Vec<NewsletterEmailSend>,
    jobs: Vec<JobEntry>,
}

#[derive(Clone, Default)]
struct Faults {
    rejected_token_resources: HashSet<Uuid>,
    fail_enqueue: bool,
}

/// In-memory [`Store`] and [`QueueProvider`] for development and tests.
///
/// Transactions take the whole state lock, work on a copy and write it back on
/// commit, so they are fully serialized. Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<std::sync::Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_subscriber(
        &self,
        email: &str,
        is_verified: bool,
    ) -> Result<Subscriber, String> {
        let email = SubscriberEmail::parse(email.to_string())?;
        let subscriber = Subscriber::new(email, is_verified, Utc::now());
        self.state.lock().await.subscribers.push(subscriber.clone());
        Ok(subscriber)
    }

    pub async fn add_newsletter(&self, title: &str, content: &str) -> Newsletter {
        let newsletter = Newsletter::draft(title, content, Utc::now());
        self.state.lock().await.newsletters.push(newsletter.clone());
        newsletter
    }

    pub async fn newsletter(&self, id: Uuid) -> Option<Newsletter> {
        let state = self.state.lock().await;
        state.newsletters.iter().find(|n| n.id == id).cloned()
    }

    pub async fn subscriber(&self, id: Uuid) -> Option<Subscriber> {
        let state = self.state.lock().await;
        state.subscribers.iter().find(|s| s.id == id).cloned()
    }

    pub async fn jobs(&self) -> Vec<JobEntry> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn email_sends(&self, newsletter_id: Uuid) -> Vec<NewsletterEmailSend> {
        let state = self.state.lock().await;
        state
            .email_sends
            .iter()
            .filter(|s| s.newsletter_id == newsletter_id)
            .cloned()
            .collect()
    }

    pub async fn token_count(&self) -> usize {
        self.state.lock().await.tokens.len()
    }

    /// Make token issuance fail for one resource.
    pub fn reject_tokens_for(&self, resource_id: Uuid) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.rejected_token_resources.insert(resource_id);
        }
    }

    /// Make every enqueue fail until switched back off.
    pub fn fail_enqueues(&self, fail: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_enqueue = fail;
        }
    }

    fn faults(&self) -> Faults {
        self.faults
            .lock()
            .map(|faults| faults.clone())
            .unwrap_or_default()
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    faults: Faults,
}

#[async_trait]
impl Store for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();

        Ok(MemoryTransaction {
            guard,
            working,
            faults: self.faults(),
        })
    }
}

#[async_trait]
impl TokenStore for MemoryTransaction {
    async fn insert_token(&mut self, token: &Token) -> Result<(), StoreError> {
        if self
            .faults
            .rejected_token_resources
            .contains(&token.meta.resource_id)
        {
            return Err(StoreError::Unavailable(format!(
                "token insert rejected for {}",
                token.meta.resource_id
            )));
        }

        if self.working.tokens.iter().any(|t| t.value == token.value) {
            return Err(StoreError::Conflict(String::from("tokens.value")));
        }

        self.working.tokens.push(token.clone());
        Ok(())
    }

    async fn find_token(
        &mut self,
        mode: TokenMode,
        value: &str,
    ) -> Result<Option<Token>, StoreError> {
        Ok(self
            .working
            .tokens
            .iter()
            .find(|t| t.mode == mode && t.value == value)
            .cloned())
    }

    async fn delete_token(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let before = self.working.tokens.len();
        self.working.tokens.retain(|t| t.id != id);
        Ok(self.working.tokens.len() < before)
    }
}

impl MemoryTransaction {
    fn newsletter_mut(&mut self, id: Uuid) -> Option<&mut Newsletter> {
        self.working.newsletters.iter_mut().find(|n| n.id == id)
    }

    fn email_send_mut(
        &mut self,
        newsletter_id: Uuid,
        subscriber_id: Uuid,
    ) -> Option<&mut NewsletterEmailSend> {
        self.working
            .email_sends
            .iter_mut()
            .find(|s| s.newsletter_id == newsletter_id && s.subscriber_id == subscriber_id)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }

    async fn verified_subscribers(&mut self) -> Result<Vec<Subscriber>, StoreError> {
        let mut subscribers: Vec<Subscriber> = self
            .working
            .subscribers
            .iter()
            .filter(|s| s.is_verified)
            .cloned()
            .collect();
        subscribers.sort_by_key(|s| s.subscribed_at);
        Ok(subscribers)
    }

    async fn count_verified_subscribers(&mut self) -> Result<i64, StoreError> {
        Ok(self
            .working
            .subscribers
            .iter()
            .filter(|s| s.is_verified)
            .count() as i64)
    }

    async fn delete_subscriber(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let before = self.working.subscribers.len();
        self.working.subscribers.retain(|s| s.id != id);
        Ok(self.working.subscribers.len() < before)
    }

    async fn find_newsletter(&mut self, id: Uuid) -> Result<Option<Newsletter>, StoreError> {
        Ok(self.working.newsletters.iter().find(|n| n.id == id).cloned())
    }

    async fn dispatchable_newsletters(&mut self) -> Result<Vec<Newsletter>, StoreError> {
        let mut newsletters: Vec<Newsletter> = self
            .working
            .newsletters
            .iter()
            .filter(|n| n.is_dispatchable())
            .cloned()
            .collect();
        newsletters.sort_by_key(|n| n.created_at);
        Ok(newsletters)
    }

    async fn mark_ready_to_send(
        &mut self,
        id: Uuid,
        total_recipients: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Newsletter>, StoreError> {
        let Some(newsletter) = self.newsletter_mut(id) else {
            return Ok(None);
        };

        if !newsletter.send_status.is_draft() {
            return Ok(None);
        }

        newsletter.send_status = SendStatus::ReadyToSend;
        newsletter.total_recipients = total_recipients;
        newsletter.updated_at = now;
        Ok(Some(newsletter.clone()))
    }

    async fn claim_newsletter(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Newsletter>, StoreError> {
        let Some(newsletter) = self.newsletter_mut(id) else {
            return Ok(None);
        };

        if !newsletter.is_dispatchable() {
            return Ok(None);
        }

        newsletter.send_status = SendStatus::Sending;
        newsletter.sending_started_at.get_or_insert(now);
        newsletter.updated_at = now;
        Ok(Some(newsletter.clone()))
    }

    async fn record_dispatch_progress(
        &mut self,
        id: Uuid,
        emails_sent: i32,
        status: SendStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(newsletter) = self.newsletter_mut(id) else {
            return Err(StoreError::Corrupted(format!("newsletter {} is missing", id)));
        };

        newsletter.send_status = newsletter
            .send_status
            .transition(status)
            .map_err(StoreError::Corrupted)?;
        newsletter.emails_sent = emails_sent;
        if status.is_terminal() {
            newsletter.sending_completed_at = Some(now);
        }
        newsletter.updated_at = now;
        Ok(())
    }

    async fn enqueue(&mut self, entry: &JobEntry) -> Result<(), StoreError> {
        if self.faults.fail_enqueue {
            return Err(StoreError::Unavailable(String::from("queue insert rejected")));
        }

        self.working.jobs.push(entry.clone());
        Ok(())
    }

    async fn insert_email_send(
        &mut self,
        send: NewEmailSend,
        now: DateTime<Utc>,
    ) -> Result<NewsletterEmailSend, StoreError> {
        if self
            .email_send_mut(send.newsletter_id, send.subscriber_id)
            .is_some()
        {
            return Err(StoreError::Conflict(String::from(
                "newsletter_email_sends_unique_recipient",
            )));
        }

        let row = send.into_pending(now);
        self.working.email_sends.push(row.clone());
        Ok(row)
    }

    async fn find_email_send(
        &mut self,
        newsletter_id: Uuid,
        subscriber_id: Uuid,
    ) -> Result<Option<NewsletterEmailSend>, StoreError> {
        Ok(self
            .email_send_mut(newsletter_id, subscriber_id)
            .map(|row| row.clone()))
    }

    async fn update_email_send_status(
        &mut self,
        newsletter_id: Uuid,
        subscriber_id: Uuid,
        status: DeliveryStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<NewsletterEmailSend>, StoreError> {
        let Some(row) = self.email_send_mut(newsletter_id, subscriber_id) else {
            return Ok(None);
        };

        row.status = status;
        row.error_message = error_message.map(String::from);
        match status {
            DeliveryStatus::Sent => row.sent_at = Some(now),
            DeliveryStatus::Failed => row.failed_at = Some(now),
            DeliveryStatus::Pending | DeliveryStatus::Bounced => {}
        }
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn email_sends_for(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<Vec<NewsletterEmailSend>, StoreError> {
        let mut rows: Vec<NewsletterEmailSend> = self
            .working
            .email_sends
            .iter()
            .filter(|s| s.newsletter_id == newsletter_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.scheduled_at);
        Ok(rows)
    }

    async fn scheduled_subscriber_ids(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<HashSet<Uuid>, StoreError> {
        Ok(self
            .working
            .email_sends
            .iter()
            .filter(|s| s.newsletter_id == newsletter_id)
            .map(|s| s.subscriber_id)
            .collect())
    }

    async fn count_scheduled_between(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .working
            .email_sends
            .iter()
            .filter(|s| s.scheduled_at >= from && s.scheduled_at < to)
            .count() as i64)
    }

    async fn send_stats(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<NewsletterSendStats, StoreError> {
        Ok(NewsletterSendStats::from_statuses(
            self.working
                .email_sends
                .iter()
                .filter(|s| s.newsletter_id == newsletter_id)
                .map(|s| &s.status),
        ))
    }

    async fn all_send_stats(&mut self) -> Result<HashMap<Uuid, NewsletterSendStats>, StoreError> {
        let mut grouped: HashMap<Uuid, Vec<&DeliveryStatus>> = HashMap::new();
        for send in &self.working.email_sends {
            grouped
                .entry(send.newsletter_id)
                .or_default()
                .push(&send.status);
        }

        Ok(grouped
            .into_iter()
            .map(|(id, statuses)| (id, NewsletterSendStats::from_statuses(statuses)))
            .collect())
    }
}

#[async_trait]
impl QueueProvider for MemoryStore {
    async fn insert(&self, entry: &JobEntry) -> Result<(), JobError> {
        if self.faults().fail_enqueue {
            return Err(StoreError::Unavailable(String::from("queue insert rejected")).into());
        }

        self.state.lock().await.jobs.push(entry.clone());
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<JobEntry>, JobError> {
        let mut state = self.state.lock().await;

        for entry in state.jobs.iter_mut() {
            if entry.is_abandoned(stale_before) && entry.attempts >= entry.max_attempts {
                entry.status = JobStatus::Failed;
                entry.last_error = Some(String::from(ABANDONED_ERROR));
                entry.locked_at = None;
                entry.locked_by = None;
                entry.completed_at = Some(now);
            }
        }

        let next = state
            .jobs
            .iter_mut()
            .filter(|e| e.is_claimable(now, stale_before))
            .min_by_key(|e| (e.run_at, e.created_at));

        Ok(next.map(|entry| {
            entry.status = JobStatus::Running;
            entry.locked_at = Some(now);
            entry.locked_by = Some(worker_id.to_string());
            entry.attempts += 1;
            entry.clone()
        }))
    }

    async fn update(&self, entry: &JobEntry) -> Result<(), JobError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.jobs.iter_mut().find(|e| e.id == entry.id) {
            *existing = entry.clone();
        }
        Ok(())
    }
}
