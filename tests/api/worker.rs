use chrono::Duration;
use claim::{assert_none, assert_some};
use newsletter_dispatch::dispatch::MarketingEmailJob;
use newsletter_dispatch::domain::delivery_status::DeliveryStatus;
use newsletter_dispatch::domain::send_status::SendStatus;
use newsletter_dispatch::queue::{enqueue, JobOutcome, JobStatus, QueueProvider};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::helpers::{after_send_window, early_morning, job_payload, test_policy, TestApp};

#[tokio::test]
async fn due_email_jobs_deliver_and_mark_their_ledger_rows_sent() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(3).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(after_send_window(early_morning())).await;

    assert_eq!(outcomes, vec![JobOutcome::Completed; 3]);
    for row in app.store.email_sends(newsletter.id).await {
        assert_eq!(row.status, DeliveryStatus::Sent);
        assert_some!(row.sent_at);
        assert_none!(row.error_message);
    }
    assert!(app
        .email_jobs()
        .await
        .iter()
        .all(|job| job.status == JobStatus::Completed));
}

#[tokio::test]
async fn email_jobs_are_not_due_before_their_slot() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(2).await;
    app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(early_morning() + Duration::hours(1)).await;

    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn one_failing_recipient_does_not_affect_the_others() {
    let app = TestApp::spawn_app().await;
    let subscribers = app.add_verified_subscribers(3).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let unlucky = &subscribers[0];

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .and(body_string_contains(unlucky.email.to_string()))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&app.email_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(after_send_window(early_morning())).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Retrying { .. }))
            .count(),
        1
    );

    for row in app.store.email_sends(newsletter.id).await {
        if row.subscriber_id == unlucky.id {
            assert_eq!(row.status, DeliveryStatus::Failed);
            assert_some!(row.failed_at);
            assert_some!(row.error_message);
        } else {
            assert_eq!(row.status, DeliveryStatus::Sent);
        }
    }
    assert_eq!(app.newsletter(newsletter.id).await.send_status, SendStatus::Sent);
}

#[tokio::test]
async fn a_retried_email_overwrites_its_failure() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let first_try = after_send_window(early_morning());

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(first_try).await;
    let [JobOutcome::Retrying { run_at }] = outcomes.as_slice() else {
        panic!("Expected a retry, got {:?}", outcomes);
    };
    assert!(*run_at > first_try);
    assert_eq!(
        app.store.email_sends(newsletter.id).await[0].status,
        DeliveryStatus::Failed
    );

    app.email_server.reset().await;
    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(*run_at).await;

    assert_eq!(outcomes, vec![JobOutcome::Completed]);
    let row = &app.store.email_sends(newsletter.id).await[0];
    assert_eq!(row.status, DeliveryStatus::Sent);
    assert_none!(&row.error_message);
    assert_eq!(app.email_jobs().await[0].attempts, 2);
}

#[tokio::test]
async fn an_email_already_sent_is_not_sent_again() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let later = after_send_window(early_morning());

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;

    app.run_due_jobs(later).await;

    // A redelivery of the same job, as after a worker crash.
    let payload: MarketingEmailJob = job_payload(&app.email_jobs().await[0]);
    enqueue(&app.store, &payload, later).await.unwrap();
    let outcomes = app.run_due_jobs(later).await;

    assert_eq!(outcomes, vec![JobOutcome::Completed]);
    assert_eq!(
        app.store.email_sends(newsletter.id).await[0].status,
        DeliveryStatus::Sent
    );
}

#[tokio::test]
async fn an_email_job_gives_up_after_five_attempts() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&app.email_server)
        .await;

    let mut now = after_send_window(early_morning());
    let mut outcomes = Vec::new();
    for _ in 0..6 {
        outcomes.extend(app.run_due_jobs(now).await);
        now = now + Duration::hours(1);
    }

    assert_eq!(outcomes.len(), 5);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Retrying { .. }))
            .count(),
        4
    );
    assert_eq!(outcomes.last(), Some(&JobOutcome::Failed));

    let job = &app.email_jobs().await[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 5);
    assert_some!(job.last_error.as_ref());
    assert_eq!(
        app.store.email_sends(newsletter.id).await[0].status,
        DeliveryStatus::Failed
    );
}

#[tokio::test]
async fn a_job_abandoned_by_a_crashed_worker_is_picked_up_after_its_lock_expires() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    let newsletter = app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let due = after_send_window(early_morning());

    // Claimed but never finished, as when a worker dies mid-job.
    assert_some!(app
        .store
        .claim_next("crashed-worker", due, due - Duration::minutes(10))
        .await
        .unwrap());

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(due + Duration::minutes(5)).await;
    assert!(outcomes.is_empty());

    let outcomes = app.run_due_jobs(due + Duration::minutes(11)).await;

    assert_eq!(outcomes, vec![JobOutcome::Completed]);
    let job = &app.email_jobs().await[0];
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(
        app.store.email_sends(newsletter.id).await[0].status,
        DeliveryStatus::Sent
    );
}

#[tokio::test]
async fn a_job_abandoned_on_its_last_attempt_is_marked_failed() {
    let mut policy = test_policy();
    policy.max_attempts = 1;
    let app = TestApp::spawn_app_with_policy(policy).await;
    app.add_verified_subscribers(1).await;
    app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let due = after_send_window(early_morning());

    app.store
        .claim_next("crashed-worker", due, due - Duration::minutes(10))
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&app.email_server)
        .await;

    let outcomes = app.run_due_jobs(due + Duration::minutes(11)).await;

    assert!(outcomes.is_empty());
    let job = &app.email_jobs().await[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_none!(job.locked_by.as_ref());
    assert_some!(job.last_error.as_ref());
}
