//! Distributed lock port.
//!
//! Consulted by the resume coordinator so only one caller drives a given
//! sandbox's resume at a time. The real distributed lock service is out of
//! scope here; this is the interface plus two implementations: an in-memory
//! one for tests, and a `NullDistributedLock` that always grants the lock --
//! the documented graceful-degradation posture for a deployment that
//! doesn't run one.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::ApiResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub fencing_token: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(LockToken),
    NotObtained,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Single attempt, no retry.
    async fn acquire(&self, key: &str, ttl: Duration) -> ApiResult<LockOutcome>;
    /// No-op if `token` no longer owns the lock (already expired and
    /// reacquired by someone else) -- never releases a lock it doesn't hold.
    async fn release(&self, token: &LockToken) -> ApiResult<()>;

    /// Retries `acquire` with exponential backoff until the lock is granted
    /// or `wait` elapses. Used by callers that want to block on another
    /// holder finishing rather than fail fast.
    async fn acquire_wait(&self, key: &str, ttl: Duration, wait: Duration) -> ApiResult<LockOutcome> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut backoff = Duration::from_millis(25);
        loop {
            match self.acquire(key, ttl).await? {
                LockOutcome::Acquired(token) => return Ok(LockOutcome::Acquired(token)),
                LockOutcome::NotObtained => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return Ok(LockOutcome::NotObtained);
                    }
                    tokio::time::sleep(backoff.min(remaining)).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }
    }
}

struct Entry {
    fencing_token: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryDistributedLock {
    held: DashMap<String, Entry>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> ApiResult<LockOutcome> {
        let now = Instant::now();
        let fencing_token = Uuid::new_v4();

        // `DashMap::entry` locks the key's shard for the whole closure, so
        // the "is it held" check and the grant are atomic -- unlike a
        // separate get() then insert(), which would let two concurrent
        // callers both observe an empty slot and both grant themselves the
        // lock.
        let mut granted = None;
        self.held
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now {
                    entry.fencing_token = fencing_token;
                    entry.expires_at = now + ttl;
                    granted = Some(fencing_token);
                }
            })
            .or_insert_with(|| {
                granted = Some(fencing_token);
                Entry {
                    fencing_token,
                    expires_at: now + ttl,
                }
            });

        Ok(match granted {
            Some(fencing_token) => LockOutcome::Acquired(LockToken {
                key: key.to_string(),
                fencing_token,
            }),
            None => LockOutcome::NotObtained,
        })
    }

    async fn release(&self, token: &LockToken) -> ApiResult<()> {
        if let Some(entry) = self.held.get(&token.key)
            && entry.fencing_token == token.fencing_token
        {
            drop(entry);
            self.held.remove(&token.key);
        }
        Ok(())
    }
}

/// Always grants the lock immediately. Safe only because the resume path
/// is written to tolerate a concurrent duplicate resume (it re-checks
/// sandbox state after the fast path anyway) -- without a real lock it just
/// loses the "only one caller drives it" optimization, not correctness.
#[derive(Default)]
pub struct NullDistributedLock;

impl NullDistributedLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl DistributedLock for NullDistributedLock {
    async fn acquire(&self, key: &str, _ttl: Duration) -> ApiResult<LockOutcome> {
        Ok(LockOutcome::Acquired(LockToken {
            key: key.to_string(),
            fencing_token: Uuid::new_v4(),
        }))
    }

    async fn release(&self, _token: &LockToken) -> ApiResult<()> {
        Ok(())
    }
}
