use futures::{Stream, StreamExt};
use serde_json::Value;

use super::buffer::{BufferPressure, ChunkBuffer};
use super::connector::{ByteStream, StreamPolicy};
use super::error::RelayError;
use super::framing::{FormatSniffer, Framer, LineFramer, WireFormat};
use super::UpstreamChunk;

/// Some backends close an event stream with this sentinel instead of an
/// explicit `end` record.
const DONE_SENTINEL: &str = "[DONE]";

/// Stateful bytes → [`UpstreamChunk`] decoder for one upstream connection.
///
/// Records may arrive split across any number of `feed` calls; output order
/// always matches record order in the source.
#[derive(Debug)]
pub struct UpstreamChunkParser {
    buffer: ChunkBuffer,
    sniffer: FormatSniffer,
    framer: Option<Framer>,
    skipped: usize,
}

impl UpstreamChunkParser {
    pub fn new(soft_ceiling: usize, hard_ceiling: usize) -> Self {
        Self {
            buffer: ChunkBuffer::new(soft_ceiling, hard_ceiling),
            sniffer: FormatSniffer::new(),
            framer: None,
            skipped: 0,
        }
    }

    pub fn for_policy(policy: &StreamPolicy) -> Self {
        Self::new(policy.soft_ceiling, policy.hard_ceiling)
    }

    pub fn format(&self) -> Option<WireFormat> {
        self.framer.as_ref().map(Framer::format)
    }

    /// Records dropped because they were not valid structured data.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Bytes thrown away by hard-ceiling truncation.
    pub fn discarded_bytes(&self) -> usize {
        self.buffer.discarded_total()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<UpstreamChunk> {
        let mut out = Vec::new();
        if bytes.is_empty() {
            return out;
        }

        if let BufferPressure::Drain = self.buffer.append(bytes) {
            tracing::trace!(buffered = self.buffer.len(), "soft ceiling reached, draining");
        }

        if self.framer.is_none() {
            match self.sniffer.observe(self.buffer.peek()) {
                Some(format) => self.framer = Some(Framer::for_format(format)),
                None => {
                    // Undecided means everything before the last newline is blank.
                    let _ = self.buffer.drain_complete_lines();
                    return out;
                }
            }
        }

        for line in self.buffer.drain_complete_lines() {
            self.accept_line(&line, &mut out);
        }
        out
    }

    /// Flush the trailing partial line and any unterminated record.
    pub fn finish(&mut self) -> Vec<UpstreamChunk> {
        let mut out = Vec::new();
        let remainder = self.buffer.flush_remainder();

        if self.framer.is_none() {
            let prefix = remainder.as_deref().unwrap_or("").as_bytes();
            match self.sniffer.observe_final(prefix) {
                Some(format) => self.framer = Some(Framer::for_format(format)),
                None => return out,
            }
        }

        if let Some(line) = remainder {
            self.accept_line(&line, &mut out);
        }
        if let Some(payload) = self.framer.as_mut().and_then(|f| f.finish()) {
            self.accept_payload(&payload, &mut out);
        }
        out
    }

    fn accept_line(&mut self, line: &str, out: &mut Vec<UpstreamChunk>) {
        let payload = match self.framer.as_mut() {
            Some(framer) => framer.push_line(line),
            None => None,
        };
        if let Some(payload) = payload {
            self.accept_payload(&payload, out);
        }
    }

    fn accept_payload(&mut self, payload: &str, out: &mut Vec<UpstreamChunk>) {
        if payload.trim() == DONE_SENTINEL {
            out.push(UpstreamChunk::End);
            return;
        }
        match parse_record(payload) {
            Ok(Some(chunk)) => out.push(chunk),
            Ok(None) => {
                self.skipped += 1;
                tracing::debug!(record = %preview(payload), "skipping upstream record without a known type");
            }
            Err(e) => {
                self.skipped += 1;
                tracing::warn!(error = %e, record = %preview(payload), "skipping malformed upstream record");
            }
        }
    }
}

/// Decode one record payload. `Ok(None)` means valid JSON that is not a
/// recognised chunk.
pub fn parse_record(payload: &str) -> Result<Option<UpstreamChunk>, serde_json::Error> {
    let value: Value = serde_json::from_str(payload)?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Ok(None);
    };

    let chunk = match kind {
        "begin" => UpstreamChunk::Begin,
        "chunk" | "item" => {
            UpstreamChunk::Chunk(value.get("content").cloned().unwrap_or(Value::Null))
        }
        "end" | "complete" => UpstreamChunk::End,
        "error" => {
            let message = value
                .get("content")
                .or_else(|| value.get("message"))
                .or_else(|| value.get("error"))
                .map(content_to_text)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "upstream error".to_string());
            UpstreamChunk::Error(message)
        }
        _ => return Ok(None),
    };
    Ok(Some(chunk))
}

/// String content as-is, null as empty, anything else as its JSON text.
pub fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Pull-based adapter: only reads upstream when the consumer asks for the
/// next chunk. A transport error is yielded once and ends the sequence.
pub fn chunk_stream(
    mut bytes: ByteStream,
    mut parser: UpstreamChunkParser,
) -> impl Stream<Item = Result<UpstreamChunk, RelayError>> + Send {
    async_stream::stream! {
        while let Some(next) = bytes.next().await {
            match next {
                Ok(data) => {
                    for chunk in parser.feed(&data) {
                        yield Ok(chunk);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        for chunk in parser.finish() {
            yield Ok(chunk);
        }
        if parser.skipped() > 0 || parser.discarded_bytes() > 0 {
            tracing::info!(
                format = ?parser.format(),
                skipped = parser.skipped(),
                discarded_bytes = parser.discarded_bytes(),
                "upstream stream ended with dropped data"
            );
        } else {
            tracing::debug!(format = ?parser.format(), "upstream stream ended");
        }
    }
}

/// Decode a fully-read body (long-poll responses).
pub fn parse_body(body: &[u8], policy: &StreamPolicy) -> Vec<UpstreamChunk> {
    let mut parser = UpstreamChunkParser::for_policy(policy);
    let mut chunks = parser.feed(body);
    chunks.extend(parser.finish());
    chunks
}

fn preview(payload: &str) -> String {
    const MAX: usize = 120;
    if payload.chars().count() <= MAX {
        payload.to_string()
    } else {
        let head: String = payload.chars().take(MAX).collect();
        format!("{head}...")
    }
}
