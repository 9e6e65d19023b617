use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::net::TcpListener;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_actix_web::TracingLogger;

use crate::config::{DatabaseSettings, Settings};
use crate::dispatch::jobs::registry;
use crate::dispatch::{DispatchContext, DispatchError, NewsletterProcessingJob};
use crate::email_client::{EmailClient, EmailError};
use crate::lock::RedisDispatchLock;
use crate::queue::{ticker, JobError, Worker};
use crate::routes::health_check;
use crate::store::PgStore;
use crate::tokens::{TokenError, TokenIssuer};

#[derive(thiserror::Error)]
pub enum StartupError {
    #[error("Failed to bind the health check listener.")]
    Io(#[from] std::io::Error),
    #[error("Sender email is not valid: {0}")]
    InvalidSender(String),
    #[error("Failed to build the email client.")]
    Email(#[from] EmailError),
    #[error("Failed to build the token issuer.")]
    Token(#[from] TokenError),
    #[error("Invalid Redis address.")]
    Redis(#[from] redis::RedisError),
    #[error("Dispatch settings are not usable.")]
    Dispatch(#[from] DispatchError),
    #[error("Failed to start the periodic ticker.")]
    Ticker(#[from] JobError),
}

impl std::fmt::Debug for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::utils::error_chain_fmt(self, f)
    }
}

/// The worker process: queue workers, the processing ticker and a health
/// check endpoint.
pub struct Application {
    port: u16,
    server: Server,
    worker: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl Application {
    pub async fn build(config: Settings) -> Result<Self, StartupError> {
        let policy = config.dispatch_policy();
        policy.validate()?;
        let store = PgStore::new(get_connection_db_pool(&config.database));

        let sender_email = config
            .get_email_client_sender()
            .map_err(StartupError::InvalidSender)?;
        let email_client = EmailClient::new(
            config.get_email_client_base_url(),
            sender_email,
            config.get_email_client_api(),
            Some(config.get_email_client_timeout()),
        )?;
        let issuer = TokenIssuer::new(&config.get_token_signing_key())?;
        let lock = RedisDispatchLock::new(redis::Client::open(config.get_redis_address())?);

        let ctx = DispatchContext::new(
            store.clone(),
            Arc::new(issuer),
            policy,
            Arc::new(email_client),
            Arc::new(lock),
            config.dispatch.lock_ttl(),
        );
        let worker = Worker::new(store.clone(), registry(), Arc::new(ctx))
            .concurrency(config.worker.concurrency)
            .poll_interval(config.worker.poll_interval())
            .lock_timeout(config.worker.lock_timeout())
            .start();
        let ticker = ticker::every(
            store,
            config.dispatch.processing_interval(),
            NewsletterProcessingJob::default(),
        )?;

        let listener = TcpListener::bind(config.get_address())?;
        let port = listener.local_addr()?.port();
        let server = run(listener)?;

        tracing::info!("Health check listening on {}", config.get_address());

        Ok(Self {
            port,
            server,
            worker,
            ticker,
        })
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stop(self) -> Result<(), std::io::Error> {
        let result = self.server.await;
        self.ticker.abort();
        self.worker.abort();
        result
    }
}

pub fn run(listener: TcpListener) -> Result<Server, std::io::Error> {
    let server = HttpServer::new(move || {
        // 'wrap' method adds a middleware to the App. This specific middleware provide incoming
        // request logger
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
    })
    .listen(listener)?
    .run();

    Ok(server)
}

pub fn get_connection_db_pool(config: &DatabaseSettings) -> Pool<Postgres> {
    PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_secs(2))
        .connect_lazy_with(config.get_db_options())
}
