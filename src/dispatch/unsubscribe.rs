use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::token::{Resource, Scope, TokenMode};
use crate::store::{Store, StoreError, StoreTransaction, TokenStore};
use crate::tokens::{NewToken, TokenError, TokenIssuer};

#[derive(thiserror::Error)]
pub enum UnsubscribeError {
    #[error("Unsubscribe token is not bound to a subscriber.")]
    NotASubscriber,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl std::fmt::Debug for UnsubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::utils::error_chain_fmt(self, f)
    }
}

/// Issue a hashed unsubscribe token for `subscriber_id` and return
/// `{base_url}/unsubscribe/{token}`.
pub async fn build_unsubscribe_link<T: TokenStore + ?Sized>(
    issuer: &TokenIssuer,
    store: &mut T,
    base_url: &str,
    subscriber_id: Uuid,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<String, TokenError> {
    let issued = issuer
        .issue(
            store,
            NewToken {
                scope: Scope::Unsubscribe,
                resource: Resource::Subscriber,
                resource_id: subscriber_id,
                expires_at: now + ttl,
                mode: TokenMode::Hashed,
            },
            now,
        )
        .await?;

    Ok(format!(
        "{}/unsubscribe/{}",
        base_url.trim_end_matches('/'),
        issued.plain_text
    ))
}

/// Redeem an unsubscribe link: remove the subscriber and burn the token.
///
/// Everything happens in one transaction, so a failed attempt leaves the link
/// usable.
#[tracing::instrument(name = "Unsubscribing a subscriber", skip(issuer, store, token))]
pub async fn unsubscribe<S: Store>(
    issuer: &TokenIssuer,
    store: &S,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Uuid, UnsubscribeError> {
    let mut tx = store.begin().await?;

    let token = issuer
        .validate(&mut tx, token, TokenMode::Hashed, Scope::Unsubscribe, now)
        .await?;

    if token.meta.resource != Resource::Subscriber {
        return Err(UnsubscribeError::NotASubscriber);
    }
    let subscriber_id = token.meta.resource_id;

    if !tx.delete_subscriber(subscriber_id).await? {
        tracing::warn!(%subscriber_id, "subscriber was already removed");
    }
    issuer.consume(&mut tx, token.id).await?;
    tx.commit().await?;

    tracing::info!(%subscriber_id, "subscriber unsubscribed");
    Ok(subscriber_id)
}
