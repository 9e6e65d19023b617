use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgExecutor, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Connection, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{Store, StoreError, StoreTransaction, TokenStore};
use crate::domain::delivery_status::DeliveryStatus;
use crate::domain::email_send::{NewEmailSend, NewsletterEmailSend, NewsletterSendStats};
use crate::domain::newsletter::Newsletter;
use crate::domain::send_status::SendStatus;
use crate::domain::subscriber::Subscriber;
use crate::domain::subscriber_email::SubscriberEmail;
use crate::domain::token::{MetaInformation, Token, TokenMode};
use crate::queue::{JobEntry, JobError, JobStatus, QueueProvider, ABANDONED_ERROR};

const NEWSLETTER_COLUMNS: &str = "id, title, content, send_status, total_recipients, \
    emails_sent, sending_started_at, sending_completed_at, created_at, updated_at";

const EMAIL_SEND_COLUMNS: &str = "id, newsletter_id, subscriber_id, email_address, status, \
    scheduled_at, sent_at, failed_at, error_message, queue_job_id, created_at, updated_at";

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, run_at, \
    tags, last_error, locked_at, locked_by, created_at, completed_at";

/// Postgres-backed [`Store`] and [`QueueProvider`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Store for PgStore {
    type Transaction = PgTransaction;

    #[tracing::instrument(name = "Opening a database transaction", skip(self))]
    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgTransaction { tx })
    }
}

#[async_trait]
impl TokenStore for PgTransaction {
    #[tracing::instrument(name = "Saving a token", skip(self, token), fields(token_id = %token.id))]
    async fn insert_token(&mut self, token: &Token) -> Result<(), StoreError> {
        // A failed insert must not poison the enclosing transaction.
        let mut savepoint = self.tx.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tokens (id, value, mode, meta_information, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(&token.value)
        .bind(token.mode.as_ref())
        .bind(Json(&token.meta))
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&mut savepoint)
        .await
        .map_err(map_conflict)?;

        savepoint.commit().await?;
        Ok(())
    }

    async fn find_token(
        &mut self,
        mode: TokenMode,
        value: &str,
    ) -> Result<Option<Token>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, value, mode, meta_information, created_at, expires_at
            FROM tokens
            WHERE mode = $1 AND value = $2
            "#,
        )
        .bind(mode.as_ref())
        .bind(value)
        .fetch_optional(&mut self.tx)
        .await?;

        row.map(|row| token_from_row(&row)).transpose()
    }

    async fn delete_token(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tokens WHERE id = $1")
            .bind(id)
            .execute(&mut self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn verified_subscribers(&mut self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, is_verified, subscribed_at
            FROM subscribers
            WHERE is_verified = TRUE
            ORDER BY subscribed_at, id
            "#,
        )
        .fetch_all(&mut self.tx)
        .await?;

        rows.iter().map(subscriber_from_row).collect()
    }

    async fn count_verified_subscribers(&mut self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM subscribers WHERE is_verified = TRUE")
            .fetch_one(&mut self.tx)
            .await?;

        Ok(row.try_get("count")?)
    }

    async fn delete_subscriber(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM subscribers WHERE id = $1")
            .bind(id)
            .execute(&mut self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_newsletter(&mut self, id: Uuid) -> Result<Option<Newsletter>, StoreError> {
        let query = format!("SELECT {} FROM newsletters WHERE id = $1", NEWSLETTER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut self.tx)
            .await?;

        row.map(|row| newsletter_from_row(&row)).transpose()
    }

    async fn dispatchable_newsletters(&mut self) -> Result<Vec<Newsletter>, StoreError> {
        let query = format!(
            "SELECT {} FROM newsletters \
             WHERE send_status IN ('ready_to_send', 'sending') \
             ORDER BY created_at",
            NEWSLETTER_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&mut self.tx).await?;

        rows.iter().map(newsletter_from_row).collect()
    }

    async fn mark_ready_to_send(
        &mut self,
        id: Uuid,
        total_recipients: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Newsletter>, StoreError> {
        let query = format!(
            "UPDATE newsletters \
             SET send_status = 'ready_to_send', total_recipients = $2, updated_at = $3 \
             WHERE id = $1 AND send_status = 'draft' \
             RETURNING {}",
            NEWSLETTER_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(total_recipients)
            .bind(now)
            .fetch_optional(&mut self.tx)
            .await?;

        row.map(|row| newsletter_from_row(&row)).transpose()
    }

    #[tracing::instrument(name = "Claiming a newsletter for dispatch", skip(self, now))]
    async fn claim_newsletter(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Newsletter>, StoreError> {
        // The UPDATE holds the row lock until the transaction ends.
        let query = format!(
            "UPDATE newsletters \
             SET send_status = 'sending', \
                 sending_started_at = COALESCE(sending_started_at, $2), \
                 updated_at = $2 \
             WHERE id = $1 AND send_status IN ('ready_to_send', 'sending') \
             RETURNING {}",
            NEWSLETTER_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(now)
            .fetch_optional(&mut self.tx)
            .await?;

        row.map(|row| newsletter_from_row(&row)).transpose()
    }

    async fn record_dispatch_progress(
        &mut self,
        id: Uuid,
        emails_sent: i32,
        status: SendStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !SendStatus::Sending.can_transition_to(status) {
            return Err(StoreError::Corrupted(format!(
                "newsletter cannot move from sending to {}",
                status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE newsletters
            SET emails_sent = $2,
                send_status = $3,
                sending_completed_at = CASE WHEN $3 IN ('sent', 'failed') THEN $4 ELSE NULL END,
                updated_at = $4
            WHERE id = $1 AND send_status = 'sending'
            "#,
        )
        .bind(id)
        .bind(emails_sent)
        .bind(status.as_ref())
        .bind(now)
        .execute(&mut self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupted(format!(
                "newsletter {} is not being sent",
                id
            )));
        }
        Ok(())
    }

    async fn enqueue(&mut self, entry: &JobEntry) -> Result<(), StoreError> {
        insert_job(&mut self.tx, entry).await?;
        Ok(())
    }

    async fn insert_email_send(
        &mut self,
        send: NewEmailSend,
        now: DateTime<Utc>,
    ) -> Result<NewsletterEmailSend, StoreError> {
        let row = send.into_pending(now);

        sqlx::query(
            r#"
            INSERT INTO newsletter_email_sends
                (id, newsletter_id, subscriber_id, email_address, status, scheduled_at,
                 queue_job_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(row.id)
        .bind(row.newsletter_id)
        .bind(row.subscriber_id)
        .bind(&row.email_address)
        .bind(row.status.as_ref())
        .bind(row.scheduled_at)
        .bind(row.queue_job_id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut self.tx)
        .await
        .map_err(map_conflict)?;

        Ok(row)
    }

    async fn find_email_send(
        &mut self,
        newsletter_id: Uuid,
        subscriber_id: Uuid,
    ) -> Result<Option<NewsletterEmailSend>, StoreError> {
        let query = format!(
            "SELECT {} FROM newsletter_email_sends \
             WHERE newsletter_id = $1 AND subscriber_id = $2",
            EMAIL_SEND_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(newsletter_id)
            .bind(subscriber_id)
            .fetch_optional(&mut self.tx)
            .await?;

        row.map(|row| email_send_from_row(&row)).transpose()
    }

    #[tracing::instrument(
        name = "Updating a delivery ledger row",
        skip(self, error_message, now),
        fields(status = %status)
    )]
    async fn update_email_send_status(
        &mut self,
        newsletter_id: Uuid,
        subscriber_id: Uuid,
        status: DeliveryStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<NewsletterEmailSend>, StoreError> {
        let query = format!(
            "UPDATE newsletter_email_sends \
             SET status = $3, \
                 error_message = $4, \
                 sent_at = CASE WHEN $3 = 'sent' THEN $5 ELSE sent_at END, \
                 failed_at = CASE WHEN $3 = 'failed' THEN $5 ELSE failed_at END, \
                 updated_at = $5 \
             WHERE newsletter_id = $1 AND subscriber_id = $2 \
             RETURNING {}",
            EMAIL_SEND_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(newsletter_id)
            .bind(subscriber_id)
            .bind(status.as_ref())
            .bind(error_message)
            .bind(now)
            .fetch_optional(&mut self.tx)
            .await?;

        row.map(|row| email_send_from_row(&row)).transpose()
    }

    async fn email_sends_for(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<Vec<NewsletterEmailSend>, StoreError> {
        let query = format!(
            "SELECT {} FROM newsletter_email_sends \
             WHERE newsletter_id = $1 \
             ORDER BY scheduled_at",
            EMAIL_SEND_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(newsletter_id)
            .fetch_all(&mut self.tx)
            .await?;

        rows.iter().map(email_send_from_row).collect()
    }

    async fn scheduled_subscriber_ids(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<HashSet<Uuid>, StoreError> {
        let rows =
            sqlx::query("SELECT subscriber_id FROM newsletter_email_sends WHERE newsletter_id = $1")
                .bind(newsletter_id)
                .fetch_all(&mut self.tx)
                .await?;

        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            ids.insert(row.try_get("subscriber_id")?);
        }
        Ok(ids)
    }

    async fn count_scheduled_between(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM newsletter_email_sends
            WHERE scheduled_at >= $1 AND scheduled_at < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&mut self.tx)
        .await?;

        Ok(row.try_get("count")?)
    }

    async fn send_stats(
        &mut self,
        newsletter_id: Uuid,
    ) -> Result<NewsletterSendStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM newsletter_email_sends
            WHERE newsletter_id = $1
            GROUP BY status
            "#,
        )
        .bind(newsletter_id)
        .fetch_all(&mut self.tx)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            counts.add(&row)?;
        }
        Ok(counts.into_stats())
    }

    async fn all_send_stats(&mut self) -> Result<HashMap<Uuid, NewsletterSendStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT newsletter_id, status, COUNT(*) AS count
            FROM newsletter_email_sends
            GROUP BY newsletter_id, status
            "#,
        )
        .fetch_all(&mut self.tx)
        .await?;

        let mut grouped: HashMap<Uuid, StatusCounts> = HashMap::new();
        for row in rows {
            let newsletter_id: Uuid = row.try_get("newsletter_id")?;
            grouped.entry(newsletter_id).or_default().add(&row)?;
        }

        Ok(grouped
            .into_iter()
            .map(|(id, counts)| (id, counts.into_stats()))
            .collect())
    }
}

#[async_trait]
impl QueueProvider for PgStore {
    async fn insert(&self, entry: &JobEntry) -> Result<(), JobError> {
        insert_job(&self.pool, entry)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<JobEntry>, JobError> {
        let abandoned = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed', last_error = $3, locked_at = NULL, locked_by = NULL,
                completed_at = $1
            WHERE status = 'running' AND locked_at < $2 AND attempts >= max_attempts
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(ABANDONED_ERROR)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        if abandoned.rows_affected() > 0 {
            tracing::warn!(
                jobs = abandoned.rows_affected(),
                "abandoned jobs out of attempts marked failed"
            );
        }

        // SKIP LOCKED lets several workers poll the same table without blocking.
        let query = format!(
            "UPDATE queue_jobs \
             SET status = 'running', locked_at = $1, locked_by = $2, attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM queue_jobs \
                 WHERE (status = 'pending' AND run_at <= $1) \
                    OR (status = 'running' AND locked_at < $3 AND attempts < max_attempts) \
                 ORDER BY run_at, created_at \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING {}",
            JOB_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(now)
            .bind(worker_id)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        Ok(row.map(|row| job_from_row(&row)).transpose()?)
    }

    async fn update(&self, entry: &JobEntry) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = $2,
                attempts = $3,
                run_at = $4,
                last_error = $5,
                locked_at = $6,
                locked_by = $7,
                completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(entry.status.as_ref())
        .bind(entry.attempts)
        .bind(entry.run_at)
        .bind(&entry.last_error)
        .bind(entry.locked_at)
        .bind(&entry.locked_by)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }
}

async fn insert_job<'e>(executor: impl PgExecutor<'e>, entry: &JobEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO queue_jobs
            (id, job_type, payload, status, attempts, max_attempts, run_at, tags, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id)
    .bind(&entry.job_type)
    .bind(&entry.payload)
    .bind(entry.status.as_ref())
    .bind(entry.attempts)
    .bind(entry.max_attempts)
    .bind(entry.run_at)
    .bind(&entry.tags)
    .bind(entry.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

fn map_conflict(e: sqlx::Error) -> StoreError {
    let constraint = e
        .as_database_error()
        .filter(|db| db.code().as_deref() == Some("23505"))
        .map(|db| db.constraint().unwrap_or("unknown").to_string());

    match constraint {
        Some(constraint) => StoreError::Conflict(constraint),
        None => StoreError::Database(e),
    }
}

#[derive(Default)]
struct StatusCounts {
    sent: i64,
    failed: i64,
    bounced: i64,
    pending: i64,
}

impl StatusCounts {
    fn add(&mut self, row: &PgRow) -> Result<(), StoreError> {
        let count: i64 = row.try_get("count")?;
        match DeliveryStatus::parse(row.try_get("status")?).map_err(StoreError::Corrupted)? {
            DeliveryStatus::Sent => self.sent += count,
            DeliveryStatus::Failed => self.failed += count,
            DeliveryStatus::Bounced => self.bounced += count,
            DeliveryStatus::Pending => self.pending += count,
        }
        Ok(())
    }

    fn into_stats(self) -> NewsletterSendStats {
        NewsletterSendStats::from_counts(self.sent, self.failed, self.bounced, self.pending)
    }
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber, StoreError> {
    Ok(Subscriber {
        id: row.try_get("id")?,
        email: SubscriberEmail::parse(row.try_get("email")?).map_err(StoreError::Corrupted)?,
        is_verified: row.try_get("is_verified")?,
        subscribed_at: row.try_get("subscribed_at")?,
    })
}

fn newsletter_from_row(row: &PgRow) -> Result<Newsletter, StoreError> {
    Ok(Newsletter {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        send_status: SendStatus::parse(row.try_get("send_status")?)
            .map_err(StoreError::Corrupted)?,
        total_recipients: row.try_get("total_recipients")?,
        emails_sent: row.try_get("emails_sent")?,
        sending_started_at: row.try_get("sending_started_at")?,
        sending_completed_at: row.try_get("sending_completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<Token, StoreError> {
    let meta: Json<MetaInformation> = row.try_get("meta_information")?;

    Ok(Token {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        value: row.try_get("value")?,
        mode: TokenMode::parse(row.try_get("mode")?).map_err(StoreError::Corrupted)?,
        meta: meta.0,
    })
}

fn email_send_from_row(row: &PgRow) -> Result<NewsletterEmailSend, StoreError> {
    Ok(NewsletterEmailSend {
        id: row.try_get("id")?,
        newsletter_id: row.try_get("newsletter_id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        email_address: row.try_get("email_address")?,
        status: DeliveryStatus::parse(row.try_get("status")?).map_err(StoreError::Corrupted)?,
        scheduled_at: row.try_get("scheduled_at")?,
        sent_at: row.try_get("sent_at")?,
        failed_at: row.try_get("failed_at")?,
        error_message: row.try_get("error_message")?,
        queue_job_id: row.try_get("queue_job_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobEntry, StoreError> {
    Ok(JobEntry {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        status: JobStatus::parse(row.try_get("status")?).map_err(StoreError::Corrupted)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        run_at: row.try_get("run_at")?,
        tags: row.try_get("tags")?,
        last_error: row.try_get("last_error")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
