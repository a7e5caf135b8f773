/// Upstream record framing, decided once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `data: {...}` lines, records separated by a blank line.
    EventStream,
    /// One JSON value per line.
    NdJson,
}

const EVENT_STREAM_FIELDS: [&[u8]; 5] = [b"data:", b"event:", b"id:", b"retry:", b":"];

/// Decides the wire format from the first non-blank bytes of a connection.
///
/// The first decision sticks for the lifetime of the connection.
#[derive(Debug, Default)]
pub struct FormatSniffer {
    decided: Option<WireFormat>,
}

impl FormatSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn decided(&self) -> Option<WireFormat> {
        self.decided
    }

    /// Inspect the bytes seen so far. Returns `None` while the prefix is blank
    /// or too short to tell an event-stream field name apart from JSON.
    pub fn observe(&mut self, prefix: &[u8]) -> Option<WireFormat> {
        if self.decided.is_some() {
            return self.decided;
        }

        let start = prefix.iter().position(|b| !b.is_ascii_whitespace())?;
        let head = &prefix[start..];

        let format = if EVENT_STREAM_FIELDS.iter().any(|field| head.starts_with(field)) {
            WireFormat::EventStream
        } else if EVENT_STREAM_FIELDS
            .iter()
            .any(|field| field.starts_with(head))
        {
            // "da", "even" ... could still become a field name.
            return None;
        } else {
            WireFormat::NdJson
        };

        tracing::debug!(?format, "upstream wire format detected");
        self.decided = Some(format);
        self.decided
    }

    /// Decide on whatever is available at end of stream. A prefix that never
    /// grew past an ambiguous field-name fragment is treated as NDJSON.
    pub fn observe_final(&mut self, prefix: &[u8]) -> Option<WireFormat> {
        if let Some(format) = self.observe(prefix) {
            return Some(format);
        }
        if prefix.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        self.decided = Some(WireFormat::NdJson);
        self.decided
    }
}

/// Turns complete lines into record payloads (the JSON text of one record).
pub trait LineFramer: Send {
    /// Feed one line (without its line ending). Returns a payload when the
    /// line completes a record.
    fn push_line(&mut self, line: &str) -> Option<String>;

    /// Called once at end of stream to release a record that was never
    /// terminated.
    fn finish(&mut self) -> Option<String>;
}

/// Event-stream records: `data:` lines joined with `\n`, flushed on a blank line.
#[derive(Debug, Default)]
pub struct EventStreamFramer {
    data: Vec<String>,
}

impl LineFramer for EventStreamFramer {
    fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_start();
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data).join("\n"));
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data.push(value.to_string());
        } else if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            // Comments and non-data fields carry nothing we relay.
        } else {
            tracing::debug!(line, "ignoring non event-stream line");
        }
        None
    }

    fn finish(&mut self) -> Option<String> {
        if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data).join("\n"))
        }
    }
}

/// Newline-delimited JSON: every non-blank line is a record.
#[derive(Debug, Default)]
pub struct NdJsonFramer;

impl LineFramer for NdJsonFramer {
    fn push_line(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn finish(&mut self) -> Option<String> {
        None
    }
}

/// The framer chosen for one connection.
#[derive(Debug)]
pub enum Framer {
    EventStream(EventStreamFramer),
    NdJson(NdJsonFramer),
}

impl Framer {
    pub fn for_format(format: WireFormat) -> Self {
        match format {
            WireFormat::EventStream => Framer::EventStream(EventStreamFramer::default()),
            WireFormat::NdJson => Framer::NdJson(NdJsonFramer),
        }
    }

    pub fn format(&self) -> WireFormat {
        match self {
            Framer::EventStream(_) => WireFormat::EventStream,
            Framer::NdJson(_) => WireFormat::NdJson,
        }
    }
}

impl LineFramer for Framer {
    fn push_line(&mut self, line: &str) -> Option<String> {
        match self {
            Framer::EventStream(f) => f.push_line(line),
            Framer::NdJson(f) => f.push_line(line),
        }
    }

    fn finish(&mut self) -> Option<String> {
        match self {
            Framer::EventStream(f) => f.finish(),
            Framer::NdJson(f) => f.finish(),
        }
    }
}
