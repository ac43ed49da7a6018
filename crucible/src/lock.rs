//! Per-entity locks.
//!
//! Short-held, exclusive locks on a specific entity row, used to guarantee
//! at most one in-flight execution-admission sequence per job (and by
//! periodic aggregate recomputation over owning entities). Acquisition is
//! fail-fast: there is no wait queue, and a failed acquisition is a
//! retryable condition at the dispatch layer.

use crate::error::LockError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::trace;

/// Builds the canonical lock key for an entity row.
pub fn row_key(app: &str, model: &str, pk: &str) -> String {
    format!("{app}.{model}:{pk}")
}

/// Non-blocking per-entity lock table.
#[derive(Clone, Default)]
pub struct LockManager {
    held: Arc<DashMap<String, ()>>,
}

/// Holds a lock until dropped.
pub struct LockGuard {
    key: String,
    held: Arc<DashMap<String, ()>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
        trace!(key = %self.key, "Lock released");
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the lock. Fails immediately with
    /// [`LockError::NotAcquired`] when another holder has it.
    pub fn try_lock(&self, key: impl Into<String>) -> Result<LockGuard, LockError> {
        let key = key.into();
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => Err(LockError::NotAcquired { key }),
            Entry::Vacant(entry) => {
                entry.insert(());
                trace!(key = %key, "Lock acquired");
                Ok(LockGuard {
                    key,
                    held: Arc::clone(&self.held),
                })
            }
        }
    }

    /// Runs `f` under the lock, releasing it on every exit path.
    pub fn with_lock<R>(&self, key: impl Into<String>, f: impl FnOnce() -> R) -> Result<R, LockError> {
        let _guard = self.try_lock(key)?;
        Ok(f())
    }
}
