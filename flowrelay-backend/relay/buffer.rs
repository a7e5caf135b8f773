use bytes::{Buf, BytesMut};

/// What happened to the buffer on the last `append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPressure {
    /// Below the soft ceiling.
    Normal,
    /// Above the soft ceiling; complete lines must be drained now.
    Drain,
    /// Above the hard ceiling with no line break anywhere. The oldest
    /// `discarded` bytes were dropped and only the trailing soft-ceiling
    /// window was kept.
    Truncated { discarded: usize },
}

/// Append-only byte accumulator with incremental line splitting.
///
/// Every appended byte comes out as part of exactly one line, in order,
/// unless it was dropped by the hard-ceiling overflow policy.
#[derive(Debug)]
pub struct ChunkBuffer {
    buf: BytesMut,
    soft_ceiling: usize,
    hard_ceiling: usize,
    discarded_total: usize,
}

impl ChunkBuffer {
    pub fn new(soft_ceiling: usize, hard_ceiling: usize) -> Self {
        let soft_ceiling = soft_ceiling.max(1);
        Self {
            buf: BytesMut::with_capacity(soft_ceiling.min(64 * 1024)),
            soft_ceiling,
            hard_ceiling: hard_ceiling.max(soft_ceiling),
            discarded_total: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> BufferPressure {
        self.buf.extend_from_slice(bytes);

        if self.buf.len() <= self.soft_ceiling {
            return BufferPressure::Normal;
        }

        if self.buf.len() > self.hard_ceiling && !self.buf.contains(&b'\n') {
            let discarded = self.buf.len() - self.soft_ceiling;
            self.buf.advance(discarded);
            self.discarded_total += discarded;
            tracing::warn!(
                discarded,
                retained = self.buf.len(),
                hard_ceiling = self.hard_ceiling,
                "upstream line exceeded hard ceiling, oldest bytes dropped"
            );
            return BufferPressure::Truncated { discarded };
        }

        BufferPressure::Drain
    }

    /// Remove and return every complete line. A trailing partial line stays
    /// buffered. Line endings (`\n` or `\r\n`) are stripped.
    pub fn drain_complete_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let complete = self.buf.split_to(last_newline + 1);
        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(decode_line)
            .collect()
    }

    /// Take whatever partial line is left at end of stream.
    pub fn flush_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(decode_line(&rest))
    }

    /// Bytes currently buffered, oldest first.
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn discarded_total(&self) -> usize {
        self.discarded_total
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_lines_only() {
        let mut buf = ChunkBuffer::new(1024, 4096);
        buf.append(b"one\ntwo\nthr");
        assert_eq!(buf.drain_complete_lines(), vec!["one", "two"]);
        assert_eq!(buf.peek(), b"thr");
        assert!(buf.drain_complete_lines().is_empty());

        buf.append(b"ee\n");
        assert_eq!(buf.drain_complete_lines(), vec!["three"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn keeps_blank_lines_and_strips_crlf() {
        let mut buf = ChunkBuffer::new(1024, 4096);
        buf.append(b"data: x\r\n\r\ndata: y\n\n");
        assert_eq!(buf.drain_complete_lines(), vec!["data: x", "", "data: y", ""]);
    }

    #[test]
    fn partial_line_is_not_yielded_until_flushed() {
        let mut buf = ChunkBuffer::new(1024, 4096);
        buf.append(b"no newline yet");
        assert!(buf.drain_complete_lines().is_empty());
        assert_eq!(buf.flush_remainder().as_deref(), Some("no newline yet"));
        assert_eq!(buf.flush_remainder(), None);
    }

    #[test]
    fn every_byte_recovered_exactly_once_for_any_split() {
        let input = b"alpha\nbeta\r\n\ngamma delta\nepsilon";
        for split in 0..=input.len() {
            let mut buf = ChunkBuffer::new(1024, 4096);
            let mut lines = Vec::new();
            buf.append(&input[..split]);
            lines.extend(buf.drain_complete_lines());
            buf.append(&input[split..]);
            lines.extend(buf.drain_complete_lines());
            lines.extend(buf.flush_remainder());
            assert_eq!(
                lines,
                vec!["alpha", "beta", "", "gamma delta", "epsilon"],
                "split at {split}"
            );
        }
    }

    #[test]
    fn multibyte_characters_survive_byte_splits() {
        let input = "héllo wörld\n".as_bytes();
        for split in 0..=input.len() {
            let mut buf = ChunkBuffer::new(1024, 4096);
            buf.append(&input[..split]);
            let mut lines = buf.drain_complete_lines();
            buf.append(&input[split..]);
            lines.extend(buf.drain_complete_lines());
            assert_eq!(lines, vec!["héllo wörld"], "split at {split}");
        }
    }

    #[test]
    fn soft_ceiling_requests_drain() {
        let mut buf = ChunkBuffer::new(8, 64);
        assert_eq!(buf.append(b"abc\n"), BufferPressure::Normal);
        assert_eq!(buf.append(b"defghij\n"), BufferPressure::Drain);
        assert_eq!(buf.drain_complete_lines(), vec!["abc", "defghij"]);
    }

    #[test]
    fn soft_ceiling_without_newline_below_hard_keeps_everything() {
        let mut buf = ChunkBuffer::new(8, 64);
        assert_eq!(buf.append(&[b'x'; 20]), BufferPressure::Drain);
        assert_eq!(buf.len(), 20);
        assert_eq!(buf.discarded_total(), 0);
    }

    #[test]
    fn hard_ceiling_keeps_trailing_soft_window() {
        let mut buf = ChunkBuffer::new(4, 10);
        buf.append(b"0123456789");
        let pressure = buf.append(b"ABCDE");
        assert_eq!(pressure, BufferPressure::Truncated { discarded: 11 });
        assert_eq!(buf.peek(), b"BCDE");
        assert_eq!(buf.discarded_total(), 11);

        buf.append(b"\nnext\n");
        assert_eq!(buf.drain_complete_lines(), vec!["BCDE", "next"]);
    }

    #[test]
    fn hard_ceiling_not_applied_when_a_newline_exists() {
        let mut buf = ChunkBuffer::new(4, 10);
        let pressure = buf.append(b"ab\ncdefghijklmnop");
        assert_eq!(pressure, BufferPressure::Drain);
        assert_eq!(buf.drain_complete_lines(), vec!["ab"]);
        assert_eq!(buf.peek(), b"cdefghijklmnop");
    }

    #[test]
    fn hard_ceiling_is_raised_to_soft() {
        let mut buf = ChunkBuffer::new(16, 2);
        assert_eq!(buf.append(&[b'z'; 10]), BufferPressure::Normal);
    }
}
