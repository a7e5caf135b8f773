use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::session_key::SessionKey;

/// A registered in-flight session.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: u64,
    pub token: CancellationToken,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

/// Process-local map from session key to the handle that aborts its work.
///
/// The lock is only held for map operations, never across an await.
#[derive(Default)]
pub struct CancellationRegistry {
    sessions: Mutex<HashMap<SessionKey, Registration>>,
    next_id: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for `key` and return the registration id that
    /// `cleanup` must present. A session still running under the same key is
    /// superseded: its token is cancelled and its record replaced.
    pub fn register(&self, key: &SessionKey, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (previous, active) = {
            let mut sessions = self.sessions();
            let previous = sessions.insert(
                key.clone(),
                Registration {
                    id,
                    token,
                    active: true,
                    registered_at: Utc::now(),
                },
            );
            (previous, sessions.values().filter(|r| r.active).count())
        };
        if let Some(previous) = previous {
            previous.token.cancel();
            tracing::info!(session_key = %key, superseded = previous.id, "session key reused, cancelled previous session");
        }
        tracing::debug!(session_key = %key, id, active, "session registered");
        id
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.sessions().get(key).is_some_and(|r| r.active)
    }

    /// Abort the handle and mark the record inactive. Returns whether a
    /// record existed; repeated calls are no-ops beyond that.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        let mut sessions = self.sessions();
        match sessions.get_mut(key) {
            Some(registration) => {
                if registration.active {
                    registration.active = false;
                    registration.token.cancel();
                    let age_ms = (Utc::now() - registration.registered_at).num_milliseconds();
                    tracing::info!(session_key = %key, age_ms, "session cancelled");
                }
                true
            }
            None => false,
        }
    }

    /// Remove the record for `key` if it still belongs to registration `id`,
    /// whether or not it was cancelled. Returns whether a record was removed.
    pub fn cleanup(&self, key: &SessionKey, id: u64) -> bool {
        let mut sessions = self.sessions();
        if sessions.get(key).is_some_and(|r| r.id == id) {
            sessions.remove(key);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &SessionKey) -> Option<Registration> {
        self.sessions().get(key).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions().values().filter(|r| r.active).count()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Registration>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
