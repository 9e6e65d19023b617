use chrono::{Duration, Utc};
use claim::{assert_none, assert_ok, assert_some};
use newsletter_dispatch::domain::delivery_status::DeliveryStatus;
use newsletter_dispatch::domain::email_send::NewEmailSend;
use newsletter_dispatch::domain::send_status::SendStatus;
use newsletter_dispatch::ledger::{all_send_stats, email_sends, send_stats};
use newsletter_dispatch::queue::{JobOutcome, QueueProvider};
use newsletter_dispatch::store::{Store, StoreError, StoreTransaction};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::helpers::{after_send_window, early_morning, PgTestApp};

#[tokio::test]
async fn a_newsletter_is_scheduled_and_delivered_through_postgres() {
    let app = PgTestApp::spawn_app().await;
    app.add_verified_subscribers(3).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    assert_eq!(newsletter.send_status, SendStatus::ReadyToSend);
    assert_eq!(newsletter.total_recipients, 3);

    let report = app.run_pass(early_morning()).await;

    assert_eq!(report.scheduled, 3);
    assert_eq!(report.completed, vec![newsletter.id]);
    assert_eq!(app.count_rows("queue_jobs").await, 3);
    assert_eq!(app.count_rows("tokens").await, 3);
    let stored = app.newsletter(newsletter.id).await;
    assert_eq!(stored.send_status, SendStatus::Sent);
    assert_eq!(stored.emails_sent, 3);
    assert_some!(stored.sending_completed_at);

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(after_send_window(early_morning())).await;

    assert_eq!(outcomes, vec![JobOutcome::Completed; 3]);
    let rows = email_sends(&app.store, newsletter.id).await.unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.status, DeliveryStatus::Sent);
        assert_some!(row.sent_at);
        assert_some!(row.queue_job_id);
    }
    let stats = send_stats(&app.store, newsletter.id).await.unwrap();
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.completion_rate, 1.0);
}

#[tokio::test]
async fn a_newsletter_that_does_not_fit_the_remaining_quota_waits_in_postgres() {
    let app = PgTestApp::spawn_app().await;
    app.add_verified_subscribers(20).await;
    let first = app.release_newsletter("Twenty").await;
    app.add_verified_subscribers(10).await;
    let second = app.release_newsletter("Thirty").await;

    let report = app.run_pass(early_morning()).await;

    assert_eq!(report.scheduled, 20);
    assert_eq!(report.remaining_quota, 15);
    assert_eq!(report.completed, vec![first.id]);
    assert_eq!(report.deferred, vec![second.id]);
    assert_eq!(
        app.newsletter(second.id).await.send_status,
        SendStatus::ReadyToSend
    );

    // Same send day, counted from the stored ledger.
    let report = app.run_pass(early_morning() + Duration::minutes(5)).await;

    assert_eq!(report.scheduled, 0);
    assert_eq!(report.remaining_quota, 15);
    assert_eq!(report.deferred, vec![second.id]);

    let stats = all_send_stats(&app.store).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[&first.id].pending, 20);
}

#[tokio::test]
async fn a_recipient_whose_token_insert_fails_is_skipped_without_losing_the_others() {
    let app = PgTestApp::spawn_app().await;
    let subscribers = app.add_verified_subscribers(3).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.reject_inserts(
        "tokens",
        &format!("NEW.meta_information->>'resource_id' = '{}'", subscribers[1].id),
    )
    .await;

    let report = app.run_pass(early_morning()).await;

    assert_eq!(report.scheduled, 2);
    assert_eq!(report.in_progress, vec![newsletter.id]);
    let rows = email_sends(&app.store, newsletter.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.subscriber_id != subscribers[1].id));
    assert_eq!(app.count_rows("tokens").await, 2);
    assert_eq!(app.count_rows("queue_jobs").await, 2);

    let stored = app.newsletter(newsletter.id).await;
    assert_eq!(stored.send_status, SendStatus::Sending);
    assert_eq!(stored.emails_sent, 2);

    // The skipped recipient is picked up once tokens can be issued again.
    app.accept_inserts("tokens").await;
    let report = app.run_pass(early_morning()).await;

    assert_eq!(report.scheduled, 1);
    assert_eq!(report.completed, vec![newsletter.id]);
}

#[tokio::test]
async fn a_queue_failure_rolls_the_whole_newsletter_back_in_postgres() {
    let app = PgTestApp::spawn_app().await;
    app.add_verified_subscribers(3).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.reject_inserts("queue_jobs", "TRUE").await;

    let report = app.run_pass(early_morning()).await;

    assert_eq!(report.failed, vec![newsletter.id]);
    let stored = app.newsletter(newsletter.id).await;
    assert_eq!(stored.send_status, SendStatus::ReadyToSend);
    assert_eq!(stored.emails_sent, 0);
    assert_none!(stored.sending_started_at);
    assert_eq!(app.count_rows("newsletter_email_sends").await, 0);
    assert_eq!(app.count_rows("tokens").await, 0);

    app.accept_inserts("queue_jobs").await;
    let report = app.run_pass(early_morning()).await;

    assert_eq!(report.scheduled, 3);
    assert_eq!(app.newsletter(newsletter.id).await.send_status, SendStatus::Sent);
}

#[tokio::test]
async fn a_second_ledger_row_for_the_same_recipient_is_a_conflict() {
    let app = PgTestApp::spawn_app().await;
    let subscribers = app.add_verified_subscribers(1).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    let send = || NewEmailSend {
        newsletter_id: newsletter.id,
        subscriber_id: subscribers[0].id,
        email_address: subscribers[0].email.to_string(),
        scheduled_at: early_morning(),
        queue_job_id: Uuid::new_v4(),
    };

    let mut tx = app.store.begin().await.unwrap();
    assert_ok!(tx.insert_email_send(send(), Utc::now()).await);
    let duplicate = tx.insert_email_send(send(), Utc::now()).await;

    assert!(matches!(
        duplicate,
        Err(StoreError::Conflict(constraint))
            if constraint == "newsletter_email_sends_unique_recipient"
    ));
}

#[tokio::test]
async fn a_draft_cannot_be_claimed_for_dispatch() {
    let app = PgTestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    let draft = app.add_draft("Not yet").await;

    let mut tx = app.store.begin().await.unwrap();
    let claimed = tx.claim_newsletter(draft.id, Utc::now()).await.unwrap();

    assert_none!(claimed);
}

#[tokio::test]
async fn an_abandoned_job_is_reclaimed_from_postgres_once_its_lock_expires() {
    let app = PgTestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let due = after_send_window(early_morning());

    let abandoned = app
        .store
        .claim_next("crashed-worker", due, due - Duration::minutes(10))
        .await
        .unwrap()
        .expect("A due job should be claimed.");
    assert_eq!(abandoned.locked_by.as_deref(), Some("crashed-worker"));

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;

    assert!(app.run_due_jobs(due + Duration::minutes(5)).await.is_empty());
    let outcomes = app.run_due_jobs(due + Duration::minutes(11)).await;

    assert_eq!(outcomes, vec![JobOutcome::Completed]);
    let rows = email_sends(&app.store, newsletter.id).await.unwrap();
    assert_eq!(rows[0].status, DeliveryStatus::Sent);
}
