use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::scheduler::{DispatchScheduler, NEWSLETTER_TAG};
use super::DispatchPolicy;
use crate::domain::delivery_status::DeliveryStatus;
use crate::email_client::{EmailPayload, EmailTransport, Unsubscribe};
use crate::lock::DispatchLock;
use crate::queue::{Job, JobKind, JobOpts, JobRegistry, JobResult};
use crate::store::{Store, StoreError, StoreTransaction};
use crate::tokens::TokenIssuer;

/// Everything the dispatch jobs need at execution time.
pub struct DispatchContext<S: Store> {
    pub store: S,
    pub scheduler: DispatchScheduler<S>,
    pub transport: Arc<dyn EmailTransport>,
    pub lock: Arc<dyn DispatchLock>,
    pub lock_ttl: Duration,
}

impl<S: Store> DispatchContext<S> {
    pub fn new(
        store: S,
        issuer: Arc<TokenIssuer>,
        policy: DispatchPolicy,
        transport: Arc<dyn EmailTransport>,
        lock: Arc<dyn DispatchLock>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            scheduler: DispatchScheduler::new(store.clone(), issuer, policy),
            store,
            transport,
            lock,
            lock_ttl,
        }
    }
}

/// Registry with every job kind of the dispatch engine.
pub fn registry<S: Store>() -> JobRegistry<DispatchContext<S>> {
    JobRegistry::new()
        .register::<NewsletterProcessingJob>()
        .register::<MarketingEmailJob>()
}

/// One newsletter email to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketingEmailJob {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub text_version: String,
    pub html_version: String,
    pub subscriber_id: Uuid,
    pub newsletter_id: Uuid,
    pub unsubscribe_link: String,
}

impl JobKind for MarketingEmailJob {
    const JOB_TYPE: &'static str = "marketing_email_job";

    fn default_opts() -> JobOpts {
        JobOpts {
            max_attempts: 5,
            run_at: None,
            tags: vec![String::from(NEWSLETTER_TAG)],
        }
    }
}

#[async_trait]
impl<S: Store> Job<DispatchContext<S>> for MarketingEmailJob {
    #[tracing::instrument(
        name = "Sending a newsletter email",
        skip(self, ctx),
        fields(
            newsletter_id = %self.newsletter_id,
            subscriber_id = %self.subscriber_id
        )
    )]
    async fn perform(self, ctx: &DispatchContext<S>) -> JobResult {
        if self.already_sent(&ctx.store).await? {
            tracing::info!("email already sent, skipping duplicate execution");
            return Ok(None);
        }

        let payload = EmailPayload {
            to: self.to.clone(),
            from: self.from.clone(),
            subject: self.subject.clone(),
            html_body: self.html_version.clone(),
            text_body: self.text_version.clone(),
        };
        let unsubscribe = Unsubscribe {
            email: self.to.clone(),
            link: self.unsubscribe_link.clone(),
        };

        match ctx.transport.send_marketing(&payload, &unsubscribe).await {
            Ok(()) => {
                self.record_delivery(&ctx.store, DeliveryStatus::Sent, None)
                    .await;
                tracing::info!("marketing email sent");
                Ok(None)
            }
            Err(e) => {
                let error_message = describe(&e);
                tracing::error!(error.cause_chain = %error_message, "failed to send marketing email");
                self.record_delivery(&ctx.store, DeliveryStatus::Failed, Some(&error_message))
                    .await;
                Err(Box::new(e))
            }
        }
    }
}

impl MarketingEmailJob {
    async fn already_sent<S: Store>(&self, store: &S) -> Result<bool, StoreError> {
        let mut tx = store.begin().await?;
        let row = tx
            .find_email_send(self.newsletter_id, self.subscriber_id)
            .await?;

        Ok(row.map_or(false, |row| row.status.is_sent()))
    }

    /// Ledger failures are logged: the email already left, so failing the job
    /// would only send it again.
    async fn record_delivery<S: Store>(
        &self,
        store: &S,
        status: DeliveryStatus,
        error_message: Option<&str>,
    ) {
        let result = async {
            let mut tx = store.begin().await?;
            let row = tx
                .update_email_send_status(
                    self.newsletter_id,
                    self.subscriber_id,
                    status,
                    error_message,
                    Utc::now(),
                )
                .await?;
            tx.commit().await?;
            Ok::<_, StoreError>(row)
        }
        .await;

        match result {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(%status, "no ledger row to update"),
            Err(e) => tracing::error!(
                error.cause_chain = ?e,
                %status,
                "failed to update email send status"
            ),
        }
    }
}

/// Periodic trigger of a scheduler pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewsletterProcessingJob {}

impl JobKind for NewsletterProcessingJob {
    const JOB_TYPE: &'static str = "newsletter_processing_job";

    // The next tick runs it again.
    fn default_opts() -> JobOpts {
        JobOpts {
            max_attempts: 1,
            run_at: None,
            tags: vec![String::from(NEWSLETTER_TAG)],
        }
    }
}

#[async_trait]
impl<S: Store> Job<DispatchContext<S>> for NewsletterProcessingJob {
    #[tracing::instrument(name = "Processing newsletters ready to send", skip(self, ctx))]
    async fn perform(self, ctx: &DispatchContext<S>) -> JobResult {
        let Some(lease) = ctx.lock.try_acquire(ctx.lock_ttl).await? else {
            tracing::info!("another dispatch pass is running, skipping");
            return Ok(None);
        };

        let result = ctx.scheduler.run_pass(Utc::now()).await;

        match ctx.lock.release(lease).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("dispatch lock expired before the pass finished"),
            Err(e) => tracing::error!(error = %e, "failed to release the dispatch lock"),
        }

        let report = result?;
        Ok(Some(serde_json::to_value(&report)?))
    }
}

fn describe(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut current = e.source();
    while let Some(cause) = current {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        current = cause.source();
    }
    message
}
