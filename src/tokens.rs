//! Issuing, validating and consuming single-purpose tokens.
//!
//! Hashed and short-code tokens are stored as an HMAC-SHA256 of their value, so
//! a leaked `tokens` table cannot be replayed. Plain tokens are stored verbatim.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use uuid::Uuid;

use crate::domain::token::{MetaInformation, Resource, Scope, Token, TokenMode};
use crate::store::{StoreError, TokenStore};

const PLAIN_TOKEN_LENGTH: usize = 30;
const HASHED_TOKEN_BYTES: usize = 15;
const SHORT_CODE_LENGTH: usize = 6;
// No 0/O or 1/I, so codes survive being read aloud or retyped.
const SHORT_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(thiserror::Error)]
pub enum TokenError {
    #[error("Token expiration must be in the future.")]
    InvalidExpiration,
    #[error("Token signing key was rejected.")]
    InvalidKey,
    #[error("Token was not found.")]
    NotFound,
    #[error("Token has expired.")]
    Expired,
    #[error("Token scope {actual:?} does not match the expected {expected:?}.")]
    ScopeMismatch { expected: Scope, actual: Scope },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl std::fmt::Debug for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::utils::error_chain_fmt(self, f)
    }
}

/// What a new token authorizes and for how long.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub scope: Scope,
    pub resource: Resource,
    pub resource_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub mode: TokenMode,
}

/// A freshly issued token. `plain_text` is the only copy of the value a
/// recipient will present; it is never stored for hashed modes.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: Token,
    pub plain_text: String,
}

/// How a presented value is searched for in storage.
enum TokenLookup<'a> {
    Raw(&'a str),
    Keyed(String),
}

impl TokenLookup<'_> {
    fn stored_value(&self) -> &str {
        match self {
            TokenLookup::Raw(value) => value,
            TokenLookup::Keyed(hash) => hash,
        }
    }
}

pub struct TokenIssuer {
    key: Hmac<Sha256>,
}

impl TokenIssuer {
    pub fn new(signing_key: &Secret<String>) -> Result<Self, TokenError> {
        let key = Hmac::<Sha256>::new_from_slice(signing_key.expose_secret().as_bytes())
            .map_err(|_| TokenError::InvalidKey)?;

        Ok(Self { key })
    }

    #[tracing::instrument(
        name = "Issuing a token",
        skip(self, store, request, now),
        fields(scope = ?request.scope, mode = ?request.mode, resource_id = %request.resource_id)
    )]
    pub async fn issue<S: TokenStore + ?Sized>(
        &self,
        store: &mut S,
        request: NewToken,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        if request.expires_at <= now {
            return Err(TokenError::InvalidExpiration);
        }

        let plain_text = match request.mode {
            TokenMode::Plain => generate_plain_value(),
            TokenMode::Hashed => generate_hashed_value(),
            TokenMode::ShortCode => generate_short_code(),
        };
        let value = self.lookup(&plain_text, request.mode).stored_value().to_string();

        let token = Token {
            id: Uuid::new_v4(),
            created_at: now,
            expires_at: request.expires_at,
            value,
            mode: request.mode,
            meta: MetaInformation {
                resource: request.resource,
                resource_id: request.resource_id,
                scope: request.scope,
            },
        };

        store.insert_token(&token).await?;

        Ok(IssuedToken { token, plain_text })
    }

    /// Find the token a recipient presented and check it still authorizes
    /// `expected_scope`. Expiration is checked before scope.
    #[tracing::instrument(name = "Validating a token", skip(self, store, value, now))]
    pub async fn validate<S: TokenStore + ?Sized>(
        &self,
        store: &mut S,
        value: &str,
        mode: TokenMode,
        expected_scope: Scope,
        now: DateTime<Utc>,
    ) -> Result<Token, TokenError> {
        let lookup = self.lookup(value, mode);

        let token = store
            .find_token(mode, lookup.stored_value())
            .await?
            .ok_or(TokenError::NotFound)?;

        if !token.is_valid_at(now) {
            return Err(TokenError::Expired);
        }

        if token.meta.scope != expected_scope {
            return Err(TokenError::ScopeMismatch {
                expected: expected_scope,
                actual: token.meta.scope,
            });
        }

        Ok(token)
    }

    /// Delete a token once what it authorized has happened.
    pub async fn consume<S: TokenStore + ?Sized>(
        &self,
        store: &mut S,
        token_id: Uuid,
    ) -> Result<(), TokenError> {
        if !store.delete_token(token_id).await? {
            return Err(TokenError::NotFound);
        }
        Ok(())
    }

    fn lookup<'a>(&self, value: &'a str, mode: TokenMode) -> TokenLookup<'a> {
        match mode {
            TokenMode::Plain => TokenLookup::Raw(value),
            TokenMode::Hashed => TokenLookup::Keyed(self.hash(value)),
            TokenMode::ShortCode => TokenLookup::Keyed(self.hash(&value.to_uppercase())),
        }
    }

    fn hash(&self, value: &str) -> String {
        let mut mac = self.key.clone();
        mac.update(value.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn generate_plain_value() -> String {
    let mut rng = rand::thread_rng();

    std::iter::repeat_with(|| rng.sample(rand::distributions::Alphanumeric))
        .map(char::from)
        .take(PLAIN_TOKEN_LENGTH)
        .collect()
}

fn generate_hashed_value() -> String {
    let mut bytes = [0u8; HASHED_TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);

    URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_short_code() -> String {
    let mut rng = rand::thread_rng();

    (0..SHORT_CODE_LENGTH)
        .map(|_| char::from(SHORT_CODE_ALPHABET[rng.gen_range(0..SHORT_CODE_ALPHABET.len())]))
        .collect()
}
