use config::{Config, ConfigError, File};
use secrecy::{ExposeSecret, Secret};
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::{
    postgres::{PgConnectOptions, PgSslMode},
    ConnectOptions,
};
use std::time;

use crate::dispatch::DispatchPolicy;
use crate::domain::subscriber_email::SubscriberEmail;

#[derive(Debug)]
pub enum Environment {
    Development,
    Production,
}

#[derive(serde::Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub email_client: EmailClientSettings,
    pub redis: RedisSettings,
    pub dispatch: DispatchSettings,
    pub worker: WorkerSettings,
    pub tokens: TokenSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub base_url: String,
}

#[derive(serde::Deserialize, Clone)]
pub struct EmailClientSettings {
    pub base_url: String,
    pub sender_email: String,
    pub api_key: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_milliseconds: u64,
}

#[derive(serde::Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    // secrecy protects secret information and prevents them to be exposed (eg: via logs)
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub name: String,
    pub require_ssl: bool,
}

#[derive(serde::Deserialize, Clone)]
pub struct RedisSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
}

#[derive(serde::Deserialize, Clone)]
pub struct DispatchSettings {
    pub sender: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_daily_emails: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub send_start_hour: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub send_start_minute: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub spacing_minutes: i64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub min_jitter_minutes: i64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_jitter_minutes: i64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub unsubscribe_token_ttl_days: i64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_attempts: i32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub processing_interval_seconds: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub lock_ttl_seconds: u64,
}

#[derive(serde::Deserialize, Clone)]
pub struct WorkerSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub concurrency: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub poll_interval_millis: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub lock_timeout_seconds: i64,
}

#[derive(serde::Deserialize, Clone)]
pub struct TokenSettings {
    pub signing_key: Secret<String>,
}

impl Settings {
    pub fn get_address(&self) -> String {
        format!(
            "{}:{}",
            self.application.get_host(),
            self.application.get_port()
        )
    }

    pub fn get_app_base_url(&self) -> String {
        self.application.get_base_url()
    }

    pub fn get_email_client_sender(&self) -> Result<SubscriberEmail, String> {
        self.email_client.get_sender_email()
    }

    pub fn get_email_client_base_url(&self) -> String {
        self.email_client.get_base_url()
    }

    pub fn get_email_client_api(&self) -> Secret<String> {
        self.email_client.get_api_key()
    }

    pub fn get_email_client_timeout(&self) -> time::Duration {
        self.email_client.get_timeout()
    }

    pub fn get_redis_address(&self) -> String {
        self.redis.get_address()
    }

    pub fn get_token_signing_key(&self) -> Secret<String> {
        self.tokens.signing_key.clone()
    }

    /// Scheduler tunables, with unsubscribe links rooted at the application's
    /// public URL.
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        self.dispatch.to_policy(self.get_app_base_url())
    }
}

impl DatabaseSettings {
    pub fn get_db_options(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };

        let mut db_options = PgConnectOptions::new()
            .host(&self.host)
            .password(self.password.expose_secret())
            .username(&self.username)
            .port(self.port)
            .database(&self.name)
            .ssl_mode(ssl_mode);

        db_options.log_statements(tracing::log::LevelFilter::Trace);

        db_options
    }
}

impl ApplicationSettings {
    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub fn get_host(&self) -> String {
        self.host.clone()
    }

    pub fn get_base_url(&self) -> String {
        self.base_url.clone()
    }
}

impl EmailClientSettings {
    pub fn get_sender_email(&self) -> Result<SubscriberEmail, String> {
        SubscriberEmail::parse(self.sender_email.clone())
    }

    pub fn get_base_url(&self) -> String {
        self.base_url.clone()
    }

    pub fn get_api_key(&self) -> Secret<String> {
        self.api_key.clone()
    }

    pub fn get_timeout(&self) -> time::Duration {
        time::Duration::from_millis(self.timeout_milliseconds)
    }
}

impl RedisSettings {
    pub fn get_address(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

impl DispatchSettings {
    pub fn to_policy(&self, base_url: String) -> DispatchPolicy {
        DispatchPolicy {
            sender: self.sender.clone(),
            base_url,
            max_daily_emails: self.max_daily_emails,
            send_start_hour: self.send_start_hour,
            send_start_minute: self.send_start_minute,
            spacing: chrono::Duration::minutes(self.spacing_minutes),
            min_jitter_minutes: self.min_jitter_minutes,
            max_jitter_minutes: self.max_jitter_minutes,
            unsubscribe_token_ttl: chrono::Duration::days(self.unsubscribe_token_ttl_days),
            max_attempts: self.max_attempts,
        }
    }

    pub fn processing_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.processing_interval_seconds)
    }

    pub fn lock_ttl(&self) -> time::Duration {
        time::Duration::from_secs(self.lock_ttl_seconds)
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.poll_interval_millis)
    }

    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_timeout_seconds)
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            unknown_env => Err(format!(
                "{} is not supported environment. Use either 'development' or 'production'.",
                unknown_env
            )),
        }
    }
}

pub fn get_configuration() -> Result<Settings, ConfigError> {
    let root_path = std::env::current_dir()
        .map_err(|e| ConfigError::Message(format!("Failed to determine the current directory: {}", e)))?;
    let config_directory = root_path.join("config");
    // Uses development environment by default
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "development".into())
        .try_into()
        .map_err(ConfigError::Message)?;
    let config_base_filepath = config_directory.join("base");
    let config_env_filepath = config_directory.join(environment.as_str());

    // It merges the base configuration file with the one from the specific environment (development or production)
    let settings = Config::builder()
        .add_source(File::from(config_base_filepath).required(true))
        .add_source(File::from(config_env_filepath).required(true))
        // Merge settings from environment variables with a prefix of APP and "__" separator
        // E.g APP_DISPATCH__MAX_DAILY_EMAILS would set Settings.dispatch.max_daily_emails
        .add_source(config::Environment::with_prefix("app").separator("__"))
        .build()?;

    tracing::info!("Application environment = {:?}", environment);

    // Try to convert the value from the configuration file into a Settings type
    settings.try_deserialize()
}
