use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::session_key::SessionKey;

/// Cancellation flags visible to every instance sharing the same medium.
///
/// The only transition that matters is unset to set, so concurrent writers
/// need no coordination. Keys arrive already sanitized.
#[async_trait]
pub trait CancellationStore: Send + Sync {
    async fn mark_cancelled(&self, key: &SessionKey) -> Result<()>;
    async fn is_cancelled(&self, key: &SessionKey) -> Result<bool>;
    async fn cleanup(&self, key: &SessionKey) -> Result<()>;
    /// Remove flags older than `max_age`. Returns how many were removed.
    async fn sweep_stale(&self, max_age: Duration) -> Result<usize>;
}
