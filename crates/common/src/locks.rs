//! Per-key exclusive sections
//!
//! Every mutation of a session runs while holding the lock for that
//! session's key; session creation holds the locks of both parties. Entries
//! are dropped from the map once nobody holds or awaits them.

use crate::errors::{AppError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Lock registry keyed by arbitrary strings
#[derive(Clone)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
    wait_timeout: Duration,
}

impl KeyedLocks {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            wait_timeout,
        }
    }

    /// Acquire the exclusive section for `key`, waiting at most the
    /// configured timeout.
    pub async fn acquire(&self, key: &str) -> Result<KeyGuard> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let guard = match tokio::time::timeout(self.wait_timeout, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.release_if_idle(key);
                return Err(AppError::Timeout {
                    operation: format!("lock {}", key),
                    timeout_ms: self.wait_timeout.as_millis() as u64,
                });
            }
        };

        debug!(key = %key, "Lock acquired");
        Ok(KeyGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        })
    }

    /// Acquire several keys in a global order so concurrent callers never
    /// deadlock on each other.
    pub async fn acquire_many(&self, keys: &[&str]) -> Result<Vec<KeyGuard>> {
        let mut ordered: Vec<&str> = keys.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.acquire(key).await?);
        }
        Ok(guards)
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release_if_idle(&self, key: &str) {
        self.locks.remove_if(key, |_, m| Arc::strong_count(m) == 1);
    }
}

/// Held section; released on drop
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release the mutex before checking whether the entry is still shared.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

/// Lock key for a session
pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Lock key for a party's availability
pub fn party_key(party_id: &str) -> String {
    format!("party:{}", party_id)
}
