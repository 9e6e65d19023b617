//! Relational store seen by the dispatch engine.
//!
//! Every read and write goes through a [`StoreTransaction`]; dropping a
//! transaction without calling `commit` rolls it back.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgTransaction};

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::delivery_status::DeliveryStatus;
use crate::domain::email_send::{NewEmailSend, NewsletterEmailSend, NewsletterSendStats};
use crate::domain::newsletter::Newsletter;
use crate::domain::send_status::SendStatus;
use crate::domain::subscriber::Subscriber;
use crate::domain::token::{Token, TokenMode};
use crate::queue::JobEntry;

#[derive(thiserror::Error)]
pub enum StoreError {
    #[error("Database query failed.")]
    Database(#[from] sqlx::Error),
    #[error("Failed to (de)serialize a stored value.")]
    Serialization(#[from] serde_json::Error),
    #[error("Stored row is corrupted: {0}")]
    Corrupted(String),
    #[error("Unique constraint violated: {0}")]
    Conflict(String),
    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

impl std::fmt::Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::utils::error_chain_fmt(self, f)
    }
}

/// Storage of issued tokens.
#[async_trait]
pub trait TokenStore: Send {
    async fn insert_token(&mut self, token: &Token) -> Result<(), StoreError>;

    /// Look up by stored value (raw value or keyed hash, depending on the mode).
    async fn find_token(
        &mut self,
        mode: TokenMode,
        value: &str,
    ) -> Result<Option<Token>, StoreError>;

    /// Returns `false` when no row was deleted.
    async fn delete_token(&mut self, id: Uuid) -> Result<bool, StoreError>;
}

/// One open transaction.
#[async_trait]
pub trait StoreTransaction: TokenStore {
    async fn commit(self) -> Result<(), StoreError>;

    async fn verified_subscribers(&mut self) -> Result<Vec<Subscriber>, StoreError>;

    async fn count_verified_subscribers(&mut self) -> Result<i64, StoreError>;

    async fn delete_subscriber(&mut self, id: Uuid) -> Result<bool, StoreError>;

    async fn find_newsletter(&mut self, id: Uuid) -> Result<Option<Newsletter>, StoreError>;

    /// Newsletters in `ready_to_send` or `sending`, oldest first.
    async fn dispatchable_newsletters(&mut self) -> Result<Vec<Newsletter>, StoreError>;

    /// `draft -> ready_to_send`, freezing the recipient count. `None` when the
    /// newsletter was not a draft.
    async fn mark_ready_to_send(
        &mut self,
        id: Uuid,
        total_recipients: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Newsletter>, StoreError>;

    /// Move a `ready_to_send` newsletter to `sending`, or re-claim one already
    /// `sending`, holding its row until the transaction ends. `None` when the
    /// newsletter is in any other status.
    async fn claim_newsletter(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Newsletter>, StoreError>;

    /// Record how many recipients are scheduled and the resulting status.
    async fn record_dispatch_progress(
        &mut self,
        id: Uuid,
        emails_sent: i32,
        status: SendStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn enqueue(&mut self, entry: &JobEntry) -> Result<(), StoreError>;

    async fn insert_email_send(
        &mut self,
        send: NewEmailSend,
        now: DateTime<Utc>,
    ) -> Result<NewsletterEmailSend, StoreError>;

    async fn find_email_send(
        &mut self,
        newsletter_id: Uuid,
        subscriber_id: Uuid,
    ) -> Result<Option<NewsletterEmailSend>, StoreError>;

    async fn update_email_send_status(
        &mut self,
        newsletter_id: Uuid,
        subscriber_id: Uuid,
        status: DeliveryStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<NewsletterEmailSend>, StoreError>;

    async fn email_sends_for(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<Vec<NewsletterEmailSend>, StoreError>;

    async fn scheduled_subscriber_ids(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<HashSet<Uuid>, StoreError>;

    /// Ledger rows with `from <= scheduled_at < to`, across all newsletters.
    async fn count_scheduled_between(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn send_stats(&mut self, newsletter_id: Uuid)
        -> Result<NewsletterSendStats, StoreError>;

    async fn all_send_stats(&mut self) -> Result<HashMap<Uuid, NewsletterSendStats>, StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync + Clone + 'static {
    type Transaction: StoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}
