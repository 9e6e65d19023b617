use chrono::{Duration, Utc};
use claim::{assert_none, assert_some};
use newsletter_dispatch::dispatch::{unsubscribe, UnsubscribeError};
use newsletter_dispatch::tokens::TokenError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::helpers::{after_send_window, early_morning, get_unsubscribe_link, job_payload, TestApp};

fn token_of(link: &str) -> &str {
    link.rsplit('/').next().unwrap()
}

#[tokio::test]
async fn the_link_in_a_sent_email_unsubscribes_its_recipient() {
    let app = TestApp::spawn_app().await;
    let subscribers = app.add_verified_subscribers(1).await;
    app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;
    app.run_due_jobs(after_send_window(early_morning())).await;

    let email_requests = app.email_server.received_requests().await.unwrap();
    let link = get_unsubscribe_link(&email_requests[0]);
    assert!(link.starts_with("https://news.example.com/unsubscribe/"));

    let unsubscribed = unsubscribe(&app.issuer, &app.store, token_of(&link), Utc::now())
        .await
        .unwrap();

    assert_eq!(unsubscribed, subscribers[0].id);
    assert_none!(app.store.subscriber(subscribers[0].id).await);
}

#[tokio::test]
async fn an_unsubscribe_link_works_only_once() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let link = job_payload(&app.email_jobs().await[0]).unsubscribe_link;

    unsubscribe(&app.issuer, &app.store, token_of(&link), Utc::now())
        .await
        .unwrap();
    let second = unsubscribe(&app.issuer, &app.store, token_of(&link), Utc::now()).await;

    assert!(matches!(
        second,
        Err(UnsubscribeError::Token(TokenError::NotFound))
    ));
    assert_eq!(app.store.token_count().await, 0);
}

#[tokio::test]
async fn an_unsubscribe_link_expires_after_thirty_days() {
    let app = TestApp::spawn_app().await;
    let subscribers = app.add_verified_subscribers(1).await;
    app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let link = job_payload(&app.email_jobs().await[0]).unsubscribe_link;

    let result = unsubscribe(
        &app.issuer,
        &app.store,
        token_of(&link),
        early_morning() + Duration::days(31),
    )
    .await;

    assert!(matches!(
        result,
        Err(UnsubscribeError::Token(TokenError::Expired))
    ));
    assert_some!(app.store.subscriber(subscribers[0].id).await);
}

#[tokio::test]
async fn a_tampered_link_is_rejected() {
    let app = TestApp::spawn_app().await;
    app.add_verified_subscribers(1).await;
    app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;
    let link = job_payload(&app.email_jobs().await[0]).unsubscribe_link;
    let tampered = format!("{}x", token_of(&link));

    let result = unsubscribe(&app.issuer, &app.store, &tampered, Utc::now()).await;

    assert!(matches!(
        result,
        Err(UnsubscribeError::Token(TokenError::NotFound))
    ));
}

#[tokio::test]
async fn unsubscribed_recipients_are_left_out_of_the_next_newsletter() {
    let app = TestApp::spawn_app().await;
    let subscribers = app.add_verified_subscribers(3).await;
    app.release_newsletter("Issue #1").await;
    app.run_pass(early_morning()).await;

    let leaving = app
        .email_jobs()
        .await
        .iter()
        .map(job_payload)
        .find(|job| job.subscriber_id == subscribers[1].id)
        .unwrap();
    unsubscribe(
        &app.issuer,
        &app.store,
        token_of(&leaving.unsubscribe_link),
        Utc::now(),
    )
    .await
    .unwrap();

    let next = app.release_newsletter("Issue #2").await;
    assert_eq!(next.total_recipients, 2);

    app.run_pass(early_morning() + Duration::days(1)).await;
    let rows = app.store.email_sends(next.id).await;

    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.subscriber_id != subscribers[1].id));
}
