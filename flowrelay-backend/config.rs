use std::path::PathBuf;
use std::time::Duration;

use crate::relay::connector::{ClientClass, StreamPolicy};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Which medium backs the cross-instance cancellation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStoreKind {
    File,
    Memory,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub upstream_url: String,
    pub upstream_token: Option<String>,
    pub api_token: Option<String>,
    pub data_dir: PathBuf,
    pub cancel_store: CancelStoreKind,
    pub connect_timeout: Duration,
    pub mobile: StreamPolicy,
    pub desktop: StreamPolicy,
    pub poll_interval: Duration,
    pub long_poll_ceiling: Duration,
    pub outbound_capacity: usize,
    pub max_attachment_bytes: usize,
    pub stale_flag_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let num = |key: &str, default: u64| -> u64 {
            get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let size = |key: &str, default: usize| -> usize {
            get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        let port = get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8081);

        let data_dir = get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".flowrelay")
        });

        let cancel_store = match get("CANCEL_STORE").as_deref() {
            Some("memory") => CancelStoreKind::Memory,
            _ => CancelStoreKind::File,
        };

        let mobile = StreamPolicy::new(
            ClientClass::Mobile,
            Duration::from_secs(num("MOBILE_TIMEOUT_SECS", 300)),
            size("MOBILE_SOFT_CEILING", 32 * KIB),
            size("MOBILE_HARD_CEILING", 256 * KIB),
        );
        let desktop = StreamPolicy::new(
            ClientClass::Desktop,
            Duration::from_secs(num("DESKTOP_TIMEOUT_SECS", 120)),
            size("DESKTOP_SOFT_CEILING", 256 * KIB),
            size("DESKTOP_HARD_CEILING", MIB),
        );

        Config {
            port,
            sentry_dsn: get("SENTRY_DSN"),
            environment: get("ENVIRONMENT").unwrap_or_else(|| "local".to_string()),
            upstream_url: get("UPSTREAM_URL")
                .unwrap_or_else(|| "http://localhost:5678/webhook/chat".to_string()),
            upstream_token: get("UPSTREAM_TOKEN"),
            api_token: get("API_TOKEN"),
            cancel_store,
            data_dir,
            connect_timeout: Duration::from_secs(num("CONNECT_TIMEOUT_SECS", 10)),
            mobile,
            desktop,
            poll_interval: Duration::from_millis(num("POLL_INTERVAL_MS", 2000).max(1)),
            long_poll_ceiling: Duration::from_secs(num("LONG_POLL_CEILING_SECS", 300)),
            outbound_capacity: size("OUTBOUND_CAPACITY", 32).max(1),
            max_attachment_bytes: size("MAX_ATTACHMENT_BYTES", 5 * MIB),
            stale_flag_ttl: Duration::from_secs(num("STALE_FLAG_TTL_SECS", 3600)),
        }
    }

    pub fn cancellations_dir(&self) -> PathBuf {
        self.data_dir.join("cancellations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("DATA_DIR", "/tmp/relay")]);
        assert_eq!(config.port, 8081);
        assert_eq!(config.environment, "local");
        assert!(config.sentry_dsn.is_none());
        assert!(config.api_token.is_none());
        assert_eq!(config.cancel_store, CancelStoreKind::File);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.long_poll_ceiling, Duration::from_secs(300));
        assert_eq!(config.cancellations_dir(), PathBuf::from("/tmp/relay/cancellations"));
    }

    #[test]
    fn test_mobile_tier_is_longer() {
        let config = config(&[]);
        assert!(config.mobile.timeout > config.desktop.timeout);
        assert!(config.mobile.soft_ceiling < config.desktop.soft_ceiling);
    }

    #[test]
    fn test_invalid_numbers_use_default() {
        let config = config(&[("PORT", "not-a-number"), ("MOBILE_TIMEOUT_SECS", "soon")]);
        assert_eq!(config.port, 8081);
        assert_eq!(config.mobile.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = config(&[("SENTRY_DSN", ""), ("API_TOKEN", "  ")]);
        assert!(config.sentry_dsn.is_none());
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "3000"),
            ("ENVIRONMENT", "production"),
            ("UPSTREAM_URL", "https://n8n.internal/webhook/abc"),
            ("CANCEL_STORE", "memory"),
            ("DESKTOP_SOFT_CEILING", "1024"),
            ("DESKTOP_HARD_CEILING", "4096"),
            ("POLL_INTERVAL_MS", "250"),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.environment, "production");
        assert_eq!(config.upstream_url, "https://n8n.internal/webhook/abc");
        assert_eq!(config.cancel_store, CancelStoreKind::Memory);
        assert_eq!(config.desktop.soft_ceiling, 1024);
        assert_eq!(config.desktop.hard_ceiling, 4096);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_hard_ceiling_never_below_soft() {
        let config = config(&[("MOBILE_SOFT_CEILING", "8192"), ("MOBILE_HARD_CEILING", "100")]);
        assert_eq!(config.mobile.hard_ceiling, 8192);
    }
}
