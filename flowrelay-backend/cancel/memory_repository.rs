use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::repository::CancellationStore;
use crate::session_key::SessionKey;

/// Single-process flag store.
#[derive(Default)]
pub struct MemoryCancellationStore {
    flags: RwLock<HashMap<SessionKey, DateTime<Utc>>>,
}

impl MemoryCancellationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancellationStore for MemoryCancellationStore {
    async fn mark_cancelled(&self, key: &SessionKey) -> Result<()> {
        self.flags
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn is_cancelled(&self, key: &SessionKey) -> Result<bool> {
        Ok(self.flags.read().await.contains_key(key))
    }

    async fn cleanup(&self, key: &SessionKey) -> Result<()> {
        self.flags.write().await.remove(key);
        Ok(())
    }

    async fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let mut flags = self.flags.write().await;
        let before = flags.len();
        flags.retain(|_, set_at| now - *set_at < max_age);
        Ok(before - flags.len())
    }
}
