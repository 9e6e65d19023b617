//! Single-writer lock around a scheduler pass.
//!
//! A pass must never run twice at once, across workers and processes. The
//! lease carries a random token so only its holder can release it, and a TTL so
//! a crashed holder cannot block dispatch forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;

pub const DISPATCH_LOCK_KEY: &str = "newsletter_dispatch:lock";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Failed to talk to Redis.")]
    Redis(#[from] redis::RedisError),
}

/// Proof of holding the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    token: String,
}

impl Lease {
    fn new(key: &str) -> Self {
        let mut rng = rand::thread_rng();
        let token = std::iter::repeat_with(|| rng.sample(rand::distributions::Alphanumeric))
            .map(char::from)
            .take(32)
            .collect();

        Self {
            key: key.to_string(),
            token,
        }
    }
}

#[async_trait]
pub trait DispatchLock: Send + Sync {
    /// `None` when someone else holds an unexpired lease.
    async fn try_acquire(&self, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Returns `false` when the lease had already expired or been taken over.
    async fn release(&self, lease: Lease) -> Result<bool, LockError>;
}

pub struct RedisDispatchLock {
    client: redis::Client,
    key: String,
}

impl RedisDispatchLock {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            key: DISPATCH_LOCK_KEY.to_string(),
        }
    }
}

#[async_trait]
impl DispatchLock for RedisDispatchLock {
    #[tracing::instrument(name = "Acquiring the dispatch lock", skip(self))]
    async fn try_acquire(&self, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut redis_conn = self.client.get_tokio_connection().await?;
        let lease = Lease::new(&self.key);

        let reply: Option<String> = redis::cmd("SET")
            .arg(&lease.key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut redis_conn)
            .await?;

        Ok(reply.map(|_| lease))
    }

    #[tracing::instrument(name = "Releasing the dispatch lock", skip(self, lease))]
    async fn release(&self, lease: Lease) -> Result<bool, LockError> {
        let mut redis_conn = self.client.get_tokio_connection().await?;

        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut redis_conn)
            .await?;

        Ok(deleted == 1)
    }
}

/// Process-local lock for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryDispatchLock {
    held: Arc<Mutex<Option<(Lease, Instant)>>>,
}

impl MemoryDispatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock on behalf of somebody else.
    pub async fn hold(&self, ttl: Duration) -> Option<Lease> {
        self.try_acquire(ttl).await.ok().flatten()
    }
}

#[async_trait]
impl DispatchLock for MemoryDispatchLock {
    async fn try_acquire(&self, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if matches!(&*held, Some((_, expires_at)) if *expires_at > now) {
            return Ok(None);
        }

        let lease = Lease::new(DISPATCH_LOCK_KEY);
        *held = Some((lease.clone(), now + ttl));
        Ok(Some(lease))
    }

    async fn release(&self, lease: Lease) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;

        match &*held {
            Some((current, expires_at)) if *current == lease && *expires_at > Instant::now() => {
                *held = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
