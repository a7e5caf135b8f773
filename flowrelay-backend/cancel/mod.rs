pub mod file_repository;
pub mod memory_repository;
pub mod registry;
pub mod repository;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session_key::SessionKey;
use registry::CancellationRegistry;
use repository::CancellationStore;

/// Poll the shared store for `key` and fire `token` once a flag shows up.
/// Exits when the token is cancelled by anyone. Store errors are logged and
/// treated as "not cancelled".
pub fn watch_store(
    store: Arc<dyn CancellationStore>,
    key: SessionKey,
    token: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if flagged(store.as_ref(), &key).await {
                tracing::info!(session_key = %key, "cancellation flag observed");
                token.cancel();
                return;
            }
        }
    })
}

/// Check the shared store, failing open on errors.
pub async fn flagged(store: &dyn CancellationStore, key: &SessionKey) -> bool {
    match store.is_cancelled(key).await {
        Ok(flag) => flag,
        Err(e) => {
            tracing::warn!(session_key = %key, error = %e, "cancellation store check failed");
            false
        }
    }
}

/// Cancel `key` locally and publish the flag for other instances.
/// Returns whether this process had the session registered.
pub async fn request_cancel(
    registry: &CancellationRegistry,
    store: &dyn CancellationStore,
    key: &SessionKey,
) -> bool {
    let was_active = registry.is_active(key);
    let local = registry.cancel(key);
    if let Err(e) = store.mark_cancelled(key).await {
        tracing::error!(session_key = %key, error = %e, "failed to publish cancellation flag");
    }
    tracing::info!(session_key = %key, local, was_active, "cancellation requested");
    local
}

/// Forget registration `id` of `key` in both views. Called on every session
/// exit. A session superseded by a newer one under the same key leaves both
/// views to its successor.
pub async fn release(
    registry: &CancellationRegistry,
    store: &dyn CancellationStore,
    key: &SessionKey,
    id: u64,
) {
    if !registry.cleanup(key, id) {
        tracing::debug!(session_key = %key, id, "registration already superseded");
        return;
    }
    if let Err(e) = store.cleanup(key).await {
        tracing::warn!(session_key = %key, error = %e, "failed to clean up cancellation flag");
    }
}
