pub mod buffer;
pub mod connector;
pub mod emitter;
pub mod error;
pub mod framing;
pub mod long_poll;
pub mod parser;
pub mod session;

use axum::response::sse::Event;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded upstream record.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamChunk {
    Begin,
    /// `chunk` or `item`; content may be any JSON value.
    Chunk(Value),
    /// `end` or `complete`.
    End,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connecting,
    Begin,
    Chunk,
    Complete,
    Error,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Complete | EventKind::Error)
    }
}

/// Client-facing event: `data: {"content":..,"type":..,"timestamp":..}` + blank line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: String,
}

impl OutboundEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn connecting() -> Self {
        Self::new(EventKind::Connecting, "")
    }

    pub fn begin() -> Self {
        Self::new(EventKind::Begin, "")
    }

    pub fn chunk(content: impl Into<String>) -> Self {
        Self::new(EventKind::Chunk, content)
    }

    pub fn complete(content: impl Into<String>) -> Self {
        Self::new(EventKind::Complete, content)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// One `data:` line; axum adds the blank line that ends the frame.
    pub fn to_sse(&self) -> Event {
        Event::default().data(self.to_json())
    }
}
