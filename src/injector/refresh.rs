//! Locks serializing cache refreshes.

use clap::ValueEnum;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// How widely a refresh blocks other refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LockScope {
    /// One lock for every audience: a slow refresh delays all others.
    Global,
    /// One lock per audience: only refreshes of the same audience wait.
    #[default]
    Audience,
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockScope::Global => write!(f, "global"),
            LockScope::Audience => write!(f, "audience"),
        }
    }
}

/// Refresh locks, held across the upstream round trip.
///
/// Per-audience locks are created on first use and kept for the life of the
/// process, like cache entries.
pub struct RefreshLocks {
    scope: LockScope,
    global: Arc<AsyncMutex<()>>,
    per_audience: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RefreshLocks {
    pub fn new(scope: LockScope) -> Self {
        Self {
            scope,
            global: Arc::new(AsyncMutex::new(())),
            per_audience: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for the refresh lock covering `audience`.
    pub async fn acquire(&self, audience: &str) -> OwnedMutexGuard<()> {
        self.lock_for(audience).lock_owned().await
    }

    fn lock_for(&self, audience: &str) -> Arc<AsyncMutex<()>> {
        match self.scope {
            LockScope::Global => Arc::clone(&self.global),
            LockScope::Audience => {
                let mut locks = self
                    .per_audience
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                Arc::clone(locks.entry(audience.to_string()).or_default())
            }
        }
    }
}
