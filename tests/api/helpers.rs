use chrono::{DateTime, Duration, TimeZone, Utc};
use fake::faker::internet::en::SafeEmail;
use fake::Fake;
use secrecy::Secret;
use sqlx::{migrate, Connection, Executor, PgConnection, PgPool};
use std::sync::Arc;
use uuid::Uuid;
use wiremock::MockServer;

use newsletter_dispatch::{
    config::{get_configuration, DatabaseSettings},
    dispatch::{
        jobs::registry, DispatchContext, DispatchPolicy, MarketingEmailJob, PassReport,
    },
    domain::{newsletter::Newsletter, subscriber::Subscriber, subscriber_email::SubscriberEmail},
    email_client::EmailClient,
    lock::MemoryDispatchLock,
    queue::{JobEntry, JobKind, JobOutcome, Worker},
    readiness::mark_ready_to_send,
    startup::get_connection_db_pool,
    store::{MemoryStore, PgStore, Store, StoreTransaction},
    tokens::TokenIssuer,
};

pub type TestContext = DispatchContext<MemoryStore>;
pub type PgTestContext = DispatchContext<PgStore>;

pub struct TestApp {
    pub store: MemoryStore,
    pub lock: MemoryDispatchLock,
    pub issuer: Arc<TokenIssuer>,
    pub email_server: MockServer,
    pub ctx: Arc<TestContext>,
    pub worker: Worker<MemoryStore, TestContext>,
}

/// 06:00 UTC, three hours before the default send window opens.
pub fn early_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 7, 6, 0, 0).unwrap()
}

pub fn test_policy() -> DispatchPolicy {
    DispatchPolicy::new(
        String::from("https://news.example.com"),
        String::from("Newsletter <newsletter@example.com>"),
    )
}

impl TestApp {
    pub async fn spawn_app() -> TestApp {
        Self::spawn_app_with_policy(test_policy()).await
    }

    pub async fn spawn_app_with_policy(policy: DispatchPolicy) -> TestApp {
        let store = MemoryStore::new();
        let lock = MemoryDispatchLock::new();
        let email_server = MockServer::start().await;
        let issuer = test_issuer();

        let ctx = dispatch_context(store.clone(), &issuer, &lock, &email_server, policy);
        let worker = Worker::new(store.clone(), registry(), ctx.clone());

        TestApp {
            store,
            lock,
            issuer,
            email_server,
            ctx,
            worker,
        }
    }

    pub async fn add_verified_subscribers(&self, count: usize) -> Vec<Subscriber> {
        let mut subscribers = Vec::with_capacity(count);
        for _ in 0..count {
            let email = format!("{}-{}", Uuid::new_v4().simple(), SafeEmail().fake::<String>());
            subscribers.push(self.store.add_subscriber(&email, true).await.unwrap());
        }
        subscribers
    }

    /// A draft released against the currently verified subscribers.
    pub async fn release_newsletter(&self, title: &str) -> Newsletter {
        let draft = self
            .store
            .add_newsletter(title, "<h1>Hello</h1><p>News of the week</p>")
            .await;

        mark_ready_to_send(&self.store, draft.id)
            .await
            .expect("Failed to release newsletter.")
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        self.ctx
            .scheduler
            .run_pass(now)
            .await
            .expect("Dispatch pass failed.")
    }

    pub async fn newsletter(&self, id: Uuid) -> Newsletter {
        self.store
            .newsletter(id)
            .await
            .expect("Newsletter is missing.")
    }

    pub async fn email_jobs(&self) -> Vec<JobEntry> {
        self.store
            .jobs()
            .await
            .into_iter()
            .filter(|entry| entry.job_type == MarketingEmailJob::JOB_TYPE)
            .collect()
    }

    /// Execute every job due by `now`, one at a time.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self
            .worker
            .process_next(now)
            .await
            .expect("Failed to poll the queue.")
        {
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// The dispatch engine on a fresh Postgres database, migrated from scratch.
pub struct PgTestApp {
    pub db_pool: PgPool,
    pub store: PgStore,
    pub email_server: MockServer,
    pub ctx: Arc<PgTestContext>,
    pub worker: Worker<PgStore, PgTestContext>,
}

impl PgTestApp {
    pub async fn spawn_app() -> PgTestApp {
        let mut config = get_configuration().expect("Missing configuration file.");
        let db_test_name = format!("db_{}", Uuid::new_v4().to_string().replace('-', "_"));

        let db_pool = configure_db(&mut config.database, db_test_name).await;
        let store = PgStore::new(db_pool.clone());
        let email_server = MockServer::start().await;

        let ctx = dispatch_context(
            store.clone(),
            &test_issuer(),
            &MemoryDispatchLock::new(),
            &email_server,
            test_policy(),
        );
        let worker = Worker::new(store.clone(), registry(), ctx.clone());

        PgTestApp {
            db_pool,
            store,
            email_server,
            ctx,
            worker,
        }
    }

    pub async fn add_verified_subscribers(&self, count: usize) -> Vec<Subscriber> {
        let mut subscribers = Vec::with_capacity(count);
        for i in 0..count {
            let email = format!("{}-{}", Uuid::new_v4().simple(), SafeEmail().fake::<String>());
            let email = SubscriberEmail::parse(email).unwrap();
            // Distinct timestamps keep the recipient order stable.
            let subscriber = Subscriber::new(email, true, Utc::now() + Duration::milliseconds(i as i64));

            sqlx::query(
                "INSERT INTO subscribers (id, email, is_verified, subscribed_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(subscriber.id)
            .bind(subscriber.email.to_string())
            .bind(subscriber.is_verified)
            .bind(subscriber.subscribed_at)
            .execute(&self.db_pool)
            .await
            .expect("Failed to insert subscriber.");

            subscribers.push(subscriber);
        }
        subscribers
    }

    pub async fn add_draft(&self, title: &str) -> Newsletter {
        let draft = Newsletter::draft(title, "<h1>Hello</h1><p>News of the week</p>", Utc::now());

        sqlx::query(
            r#"
            INSERT INTO newsletters (id, title, content, send_status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(draft.id)
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(draft.send_status.as_ref())
        .bind(draft.created_at)
        .bind(draft.updated_at)
        .execute(&self.db_pool)
        .await
        .expect("Failed to insert newsletter.");

        draft
    }

    pub async fn release_newsletter(&self, title: &str) -> Newsletter {
        let draft = self.add_draft(title).await;

        mark_ready_to_send(&self.store, draft.id)
            .await
            .expect("Failed to release newsletter.")
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        self.ctx
            .scheduler
            .run_pass(now)
            .await
            .expect("Dispatch pass failed.")
    }

    pub async fn newsletter(&self, id: Uuid) -> Newsletter {
        let mut tx = self.store.begin().await.expect("Failed to open a transaction.");
        tx.find_newsletter(id)
            .await
            .expect("Failed to read newsletter.")
            .expect("Newsletter is missing.")
    }

    pub async fn count_rows(&self, table: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.db_pool)
            .await
            .expect("Failed to count rows.");
        row.0
    }

    /// Make every insert into `table` fail when `condition` holds for the new row.
    pub async fn reject_inserts(&self, table: &str, condition: &str) {
        self.db_pool
            .execute(&*format!(
                r#"
                CREATE FUNCTION reject_{table}() RETURNS trigger AS $$
                BEGIN
                    IF {condition} THEN
                        RAISE EXCEPTION 'insert into {table} rejected';
                    END IF;
                    RETURN NEW;
                END;
                $$ LANGUAGE plpgsql;

                CREATE TRIGGER reject_{table} BEFORE INSERT ON {table}
                    FOR EACH ROW EXECUTE FUNCTION reject_{table}();
                "#
            ))
            .await
            .expect("Failed to install trigger.");
    }

    pub async fn accept_inserts(&self, table: &str) {
        self.db_pool
            .execute(&*format!(
                "DROP TRIGGER reject_{table} ON {table}; DROP FUNCTION reject_{table}();"
            ))
            .await
            .expect("Failed to drop trigger.");
    }

    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self
            .worker
            .process_next(now)
            .await
            .expect("Failed to poll the queue.")
        {
            outcomes.push(outcome);
        }
        outcomes
    }
}

async fn configure_db(db_config: &mut DatabaseSettings, db_test_name: String) -> PgPool {
    // Create database
    let mut connection = PgConnection::connect_with(&db_config.get_db_options())
        .await
        .expect("Failed to connect to Postgres.");

    connection
        .execute(&*format!(r#"CREATE DATABASE "{}";"#, db_test_name))
        .await
        .expect("Failed to create database.");

    connection
        .close()
        .await
        .expect("Failed to close connection.");

    // Execute migrations
    db_config.name = db_test_name;

    let db_pool = get_connection_db_pool(db_config);

    migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("Failed to run migrations.");

    db_pool
}

fn test_issuer() -> Arc<TokenIssuer> {
    Arc::new(TokenIssuer::new(&Secret::new(String::from("test-signing-key"))).unwrap())
}

fn dispatch_context<S: Store>(
    store: S,
    issuer: &Arc<TokenIssuer>,
    lock: &MemoryDispatchLock,
    email_server: &MockServer,
    policy: DispatchPolicy,
) -> Arc<DispatchContext<S>> {
    let sender = SubscriberEmail::parse(String::from("newsletter@example.com")).unwrap();
    let email_client =
        EmailClient::new(email_server.uri(), sender, Secret::new(Uuid::new_v4().to_string()), None)
            .expect("Failed to build email client.");

    Arc::new(DispatchContext::new(
        store,
        issuer.clone(),
        policy,
        Arc::new(email_client),
        Arc::new(lock.clone()),
        std::time::Duration::from_secs(60),
    ))
}

/// Late enough for every email scheduled in the morning window to be due.
pub fn after_send_window(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(1)
}

pub fn job_payload(entry: &JobEntry) -> MarketingEmailJob {
    serde_json::from_value(entry.payload.clone()).expect("Invalid email job payload.")
}

/// The https link of the `List-Unsubscribe` header of an email sent to the
/// mock server.
pub fn get_unsubscribe_link(email_request: &wiremock::Request) -> String {
    let body: serde_json::Value = serde_json::from_slice(&email_request.body).unwrap();
    let header = body["headers"]["List-Unsubscribe"].as_str().unwrap();

    let links: Vec<_> = linkify::LinkFinder::new()
        .links(header)
        .filter(|l| *l.kind() == linkify::LinkKind::Url)
        .map(|l| l.as_str().trim_end_matches('>').to_string())
        .filter(|l| l.starts_with("https://"))
        .collect();
    assert_eq!(links.len(), 1);

    links[0].clone()
}
