//! Read side of the delivery ledger.

use std::collections::HashMap;

use uuid::Uuid;

use crate::domain::email_send::{NewsletterEmailSend, NewsletterSendStats};
use crate::store::{Store, StoreError, StoreTransaction};

pub async fn send_stats<S: Store>(
    store: &S,
    newsletter_id: Uuid,
) -> Result<NewsletterSendStats, StoreError> {
    let mut tx = store.begin().await?;
    tx.send_stats(newsletter_id).await
}

/// Stats for every newsletter with at least one ledger row.
pub async fn all_send_stats<S: Store>(
    store: &S,
) -> Result<HashMap<Uuid, NewsletterSendStats>, StoreError> {
    let mut tx = store.begin().await?;
    tx.all_send_stats().await
}

/// Ledger rows of one newsletter in send order.
pub async fn email_sends<S: Store>(
    store: &S,
    newsletter_id: Uuid,
) -> Result<Vec<NewsletterEmailSend>, StoreError> {
    let mut tx = store.begin().await?;
    tx.email_sends_for(newsletter_id).await
}
