use chrono::Utc;
use uuid::Uuid;

use crate::domain::newsletter::Newsletter;
use crate::domain::send_status::SendStatus;
use crate::store::{Store, StoreError, StoreTransaction};

#[derive(thiserror::Error)]
pub enum ReadinessError {
    #[error("Newsletter {0} does not exist.")]
    NewsletterNotFound(Uuid),
    #[error("Newsletter cannot move from {from} to {to}.")]
    InvalidTransition { from: SendStatus, to: SendStatus },
    #[error("There are no verified subscribers to send the newsletter to.")]
    NoRecipients,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl std::fmt::Debug for ReadinessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::utils::error_chain_fmt(self, f)
    }
}

/// Release a draft for dispatch, freezing its recipient count.
///
/// Nothing is written unless every check passes.
#[tracing::instrument(name = "Marking a newsletter ready to send", skip(store))]
pub async fn mark_ready_to_send<S: Store>(
    store: &S,
    newsletter_id: Uuid,
) -> Result<Newsletter, ReadinessError> {
    let mut tx = store.begin().await?;

    let newsletter = tx
        .find_newsletter(newsletter_id)
        .await?
        .ok_or(ReadinessError::NewsletterNotFound(newsletter_id))?;

    if !newsletter
        .send_status
        .can_transition_to(SendStatus::ReadyToSend)
    {
        return Err(ReadinessError::InvalidTransition {
            from: newsletter.send_status,
            to: SendStatus::ReadyToSend,
        });
    }

    let recipients = tx.count_verified_subscribers().await?;
    if recipients == 0 {
        return Err(ReadinessError::NoRecipients);
    }
    let total_recipients = i32::try_from(recipients)
        .map_err(|_| StoreError::Corrupted(format!("{} recipients", recipients)))?;

    // A concurrent release may have won since the read above.
    let released = tx
        .mark_ready_to_send(newsletter_id, total_recipients, Utc::now())
        .await?
        .ok_or(ReadinessError::InvalidTransition {
            from: newsletter.send_status,
            to: SendStatus::ReadyToSend,
        })?;

    tx.commit().await?;

    tracing::info!(
        newsletter_id = %released.id,
        total_recipients = released.total_recipients,
        "newsletter is ready to send"
    );
    Ok(released)
}
