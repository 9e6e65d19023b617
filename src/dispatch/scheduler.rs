use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::jobs::MarketingEmailJob;
use super::schedule::{email_delay, next_send_time, send_day, strip_html};
use super::unsubscribe::build_unsubscribe_link;
use super::{DispatchError, DispatchPolicy};
use crate::domain::email_send::NewEmailSend;
use crate::domain::newsletter::Newsletter;
use crate::domain::send_status::SendStatus;
use crate::queue::{into_entry_with, JobOpts};
use crate::store::{Store, StoreTransaction};
use crate::tokens::TokenIssuer;

pub const NEWSLETTER_TAG: &str = "newsletter";

/// Summary of one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PassReport {
    /// Base send time of the day this pass scheduled into.
    pub send_day_start: Option<DateTime<Utc>>,
    /// Emails scheduled by this pass, across all newsletters.
    pub scheduled: usize,
    /// Quota left for the send day once the pass finished.
    pub remaining_quota: usize,
    /// Newsletters that reached `sent`.
    pub completed: Vec<Uuid>,
    /// Newsletters still `sending` with recipients outstanding.
    pub in_progress: Vec<Uuid>,
    /// Newsletters left alone because they don't fit the remaining quota.
    pub deferred: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

struct NewsletterOutcome {
    scheduled: usize,
    status: SendStatus,
}

/// Reads released newsletters and turns each into a batch of email jobs.
///
/// A pass is not safe to run concurrently with another one: callers hold the
/// dispatch lock around [`DispatchScheduler::run_pass`].
pub struct DispatchScheduler<S: Store> {
    store: S,
    issuer: Arc<TokenIssuer>,
    policy: DispatchPolicy,
}

impl<S: Store> DispatchScheduler<S> {
    pub fn new(store: S, issuer: Arc<TokenIssuer>, policy: DispatchPolicy) -> Self {
        Self {
            store,
            issuer,
            policy,
        }
    }

    #[tracing::instrument(name = "Running a dispatch pass", skip(self))]
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, DispatchError> {
        self.policy.validate()?;
        let base_time = next_send_time(now, self.policy.send_start_hour, self.policy.send_start_minute)
            .ok_or(DispatchError::InvalidSendTime {
                hour: self.policy.send_start_hour,
                minute: self.policy.send_start_minute,
            })?;
        let (day_start, day_end) = send_day(base_time);

        let (already_scheduled, newsletters) = {
            let mut tx = self.store.begin().await?;
            let already = tx.count_scheduled_between(day_start, day_end).await?;
            (already.max(0) as usize, tx.dispatchable_newsletters().await?)
        };

        let mut report = PassReport {
            send_day_start: Some(day_start),
            remaining_quota: self.policy.max_daily_emails.saturating_sub(already_scheduled),
            ..PassReport::default()
        };

        if newsletters.is_empty() {
            tracing::info!("no newsletters ready to send");
            return Ok(report);
        }

        let mut slot = already_scheduled;
        for newsletter in newsletters {
            let batch = newsletter
                .outstanding_recipients()
                .min(self.policy.max_daily_emails);

            if batch > report.remaining_quota {
                tracing::warn!(
                    newsletter_id = %newsletter.id,
                    recipients = batch,
                    remaining_quota = report.remaining_quota,
                    "newsletter would exceed daily limit, skipping"
                );
                report.deferred.push(newsletter.id);
                continue;
            }

            match self
                .dispatch_newsletter(newsletter.id, batch, base_time, slot, now)
                .await
            {
                Ok(outcome) => {
                    slot += outcome.scheduled;
                    report.scheduled += outcome.scheduled;
                    report.remaining_quota = report.remaining_quota.saturating_sub(outcome.scheduled);
                    if outcome.status == SendStatus::Sent {
                        report.completed.push(newsletter.id);
                    } else {
                        report.in_progress.push(newsletter.id);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error.cause_chain = ?e,
                        newsletter_id = %newsletter.id,
                        "failed to dispatch newsletter"
                    );
                    report.failed.push(newsletter.id);
                }
            }
        }

        tracing::info!(
            scheduled = report.scheduled,
            remaining_quota = report.remaining_quota,
            "dispatch pass completed"
        );
        Ok(report)
    }

    /// Claim one newsletter and schedule up to `batch` of its outstanding
    /// recipients, all in a single transaction.
    #[tracing::instrument(
        name = "Dispatching a newsletter",
        skip(self, base_time, first_slot, now),
        fields(scheduled = tracing::field::Empty)
    )]
    async fn dispatch_newsletter(
        &self,
        newsletter_id: Uuid,
        batch: usize,
        base_time: DateTime<Utc>,
        first_slot: usize,
        now: DateTime<Utc>,
    ) -> Result<NewsletterOutcome, DispatchError> {
        let mut tx = self.store.begin().await?;

        let newsletter = tx
            .claim_newsletter(newsletter_id, now)
            .await?
            .ok_or(DispatchError::NotDispatchable(newsletter_id))?;

        let already_scheduled = tx.scheduled_subscriber_ids(newsletter_id).await?;
        let eligible: Vec<_> = tx
            .verified_subscribers()
            .await?
            .into_iter()
            .filter(|s| !already_scheduled.contains(&s.id))
            .collect();

        let batch = batch.min(newsletter.outstanding_recipients());
        let text_version = strip_html(&newsletter.content);
        let mut created = 0;

        for subscriber in eligible.iter().take(batch) {
            let unsubscribe_link = match build_unsubscribe_link(
                &self.issuer,
                &mut tx,
                &self.policy.base_url,
                subscriber.id,
                self.policy.unsubscribe_token_ttl,
                now,
            )
            .await
            {
                Ok(link) => link,
                Err(e) => {
                    tracing::warn!(
                        error.cause_chain = ?e,
                        subscriber_id = %subscriber.id,
                        "failed to generate unsubscribe link, skipping recipient"
                    );
                    continue;
                }
            };

            let scheduled_at = base_time + email_delay(first_slot + created, &self.policy);
            let job = MarketingEmailJob {
                to: subscriber.email.to_string(),
                from: self.policy.sender.clone(),
                subject: newsletter.title.clone(),
                text_version: text_version.clone(),
                html_version: newsletter.content.clone(),
                subscriber_id: subscriber.id,
                newsletter_id,
                unsubscribe_link,
            };
            let entry = into_entry_with(&job, self.email_job_opts(scheduled_at), now)?;

            tx.enqueue(&entry).await?;
            tx.insert_email_send(
                NewEmailSend {
                    newsletter_id,
                    subscriber_id: subscriber.id,
                    email_address: job.to.clone(),
                    scheduled_at,
                    queue_job_id: entry.id,
                },
                now,
            )
            .await?;

            tracing::debug!(
                subscriber_id = %subscriber.id,
                %scheduled_at,
                "newsletter email job scheduled"
            );
            created += 1;
        }

        tracing::Span::current().record("scheduled", created);

        let emails_sent = newsletter.emails_sent + created as i32;
        let done = eligible.len() == created
            || emails_sent >= newsletter.total_recipients;

        if created == 0 {
            if already_scheduled.is_empty() {
                drop(tx);
                self.mark_failed(&newsletter, now).await?;
                return Err(DispatchError::NothingScheduled(newsletter_id));
            }
            if !done {
                // Nothing changed; leave the claim to the next pass.
                return Ok(NewsletterOutcome {
                    scheduled: 0,
                    status: SendStatus::Sending,
                });
            }
        }

        let status = if done {
            SendStatus::Sent
        } else {
            SendStatus::Sending
        };
        tx.record_dispatch_progress(newsletter_id, emails_sent, status, now)
            .await?;
        tx.commit().await?;

        tracing::info!(
            %newsletter_id,
            emails_scheduled = created,
            emails_sent,
            status = %status,
            "newsletter dispatch progressed"
        );
        Ok(NewsletterOutcome {
            scheduled: created,
            status,
        })
    }

    /// Recorded in a fresh transaction, after the one that claimed the
    /// newsletter was rolled back.
    async fn mark_failed(&self, newsletter: &Newsletter, now: DateTime<Utc>) -> Result<(), DispatchError> {
        let mut tx = self.store.begin().await?;

        if tx.claim_newsletter(newsletter.id, now).await?.is_none() {
            return Err(DispatchError::NotDispatchable(newsletter.id));
        }
        tx.record_dispatch_progress(newsletter.id, newsletter.emails_sent, SendStatus::Failed, now)
            .await?;
        tx.commit().await?;

        tracing::error!(newsletter_id = %newsletter.id, "no email jobs created, newsletter failed");
        Ok(())
    }

    fn email_job_opts(&self, run_at: DateTime<Utc>) -> JobOpts {
        JobOpts {
            max_attempts: self.policy.max_attempts,
            run_at: Some(run_at),
            tags: vec![String::from(NEWSLETTER_TAG)],
        }
    }
}
