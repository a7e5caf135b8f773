use std::fmt;

/// Longest key we accept once sanitized.
pub const MAX_SESSION_KEY_LEN: usize = 128;

/// A session key that is safe to use as a map key, file name or cache key.
///
/// Clients choose (or are handed) the raw key, so it is untrusted input.
/// Only ASCII alphanumerics, `-` and `_` survive, which rules out path
/// separators, `..`, whitespace and control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Sanitize a raw key. Returns `None` when nothing usable is left.
    pub fn parse(raw: &str) -> Option<Self> {
        let clean = sanitize(raw);
        if clean.is_empty() {
            None
        } else {
            Some(Self(clean))
        }
    }

    /// Generate a fresh key: `<unix-millis>-<8 hex chars>`.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{millis}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip to `[A-Za-z0-9_-]` and cap at [`MAX_SESSION_KEY_LEN`].
/// Deterministic and idempotent.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_SESSION_KEY_LEN)
        .collect()
}
