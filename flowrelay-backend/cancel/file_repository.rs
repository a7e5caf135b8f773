use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::repository::CancellationStore;
use crate::session_key::SessionKey;

const FLAG_EXTENSION: &str = "cancelled";

/// One flag file per cancelled session: `<dir>/<key>.cancelled`, holding
/// the RFC 3339 time it was set. Any process with access to `dir` sees it.
pub struct FileCancellationStore {
    dir: PathBuf,
}

impl FileCancellationStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn flag_path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.{FLAG_EXTENSION}", key.as_str()))
    }

    fn flag_age(path: &Path, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let set_at = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| {
                let modified = std::fs::metadata(path).ok()?.modified().ok()?;
                Some(DateTime::<Utc>::from(modified))
            })?;
        Some(now - set_at)
    }
}

#[async_trait]
impl CancellationStore for FileCancellationStore {
    async fn mark_cancelled(&self, key: &SessionKey) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create cancellations dir: {}", self.dir.display()))?;

        let path = self.flag_path(key);
        let tmp = self.dir.join(format!(".{}.{}.tmp", key.as_str(), uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, Utc::now().to_rfc3339())
            .with_context(|| format!("failed to write flag file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move flag file into place: {}", path.display()))?;

        tracing::debug!(session_key = %key, path = %path.display(), "cancellation flag set");
        Ok(())
    }

    async fn is_cancelled(&self, key: &SessionKey) -> Result<bool> {
        Ok(self.flag_path(key).exists())
    }

    async fn cleanup(&self, key: &SessionKey) -> Result<()> {
        let path = self.flag_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to delete flag file: {}", path.display()))
            }
        }
    }

    async fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read cancellations dir: {}", self.dir.display()));
            }
        };

        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let mut removed = 0;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FLAG_EXTENSION) {
                continue;
            }
            let Some(age) = Self::flag_age(&path, now) else {
                continue;
            };
            if age >= max_age {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove stale flag")
                    }
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "swept stale cancellation flags");
        }
        Ok(removed)
    }
}
