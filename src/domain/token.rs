use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a token authorizes. Checked independently of expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    EmailVerification,
    Unsubscribe,
    PasswordReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    User,
    Subscriber,
}

/// Persisted as an opaque JSON blob next to the token value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInformation {
    pub resource: Resource,
    pub resource_id: Uuid,
    pub scope: Scope,
}

/// How a token value is generated and stored.
///
/// - `Plain`: the raw value is stored and returned.
/// - `Hashed`: 15 random bytes, URL-safe encoded; only the keyed hash is stored.
///   Used for links embedded in emails.
/// - `ShortCode`: 6 characters a person can type; only the keyed hash is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMode {
    Plain,
    Hashed,
    ShortCode,
}

impl TokenMode {
    pub fn parse(mode: String) -> Result<TokenMode, String> {
        match mode.as_str() {
            "plain" => Ok(TokenMode::Plain),
            "hashed" => Ok(TokenMode::Hashed),
            "short_code" => Ok(TokenMode::ShortCode),
            _ => Err(format!("{} is not a valid token mode", mode)),
        }
    }
}

impl AsRef<str> for TokenMode {
    fn as_ref(&self) -> &str {
        match self {
            TokenMode::Plain => "plain",
            TokenMode::Hashed => "hashed",
            TokenMode::ShortCode => "short_code",
        }
    }
}

/// A stored token row. `value` is the raw value for plain tokens and the keyed
/// hash for the other modes.
#[derive(Debug, Clone)]
pub struct Token {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub value: String,
    pub mode: TokenMode,
    pub meta: MetaInformation,
}

impl Token {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
