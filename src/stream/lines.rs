/// SSE line tokenizer.
///
/// Splits an upstream byte stream into logical SSE lines, dropping lines
/// that are empty after trimming. Everything else (including the `data: `
/// prefix, comments, `event:` and `id:` lines) is yielded verbatim.
use futures_util::Stream;
use memchr::memchr_iter;
use smallvec::SmallVec;

struct PendingLines {
    lines: SmallVec<[String; 8]>,
    head: usize,
}

impl PendingLines {
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        let mut lines = SmallVec::new();
        lines.reserve(capacity);
        Self { lines, head: 0 }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<String> {
        if self.head >= self.lines.len() {
            return None;
        }
        let line = std::mem::take(&mut self.lines[self.head]);
        self.head += 1;
        if self.head == self.lines.len() {
            self.lines.clear();
            self.head = 0;
        }
        Some(line)
    }

    #[inline]
    fn extend_from_vec(&mut self, parsed: &mut Vec<String>) {
        if parsed.is_empty() {
            return;
        }
        self.lines.reserve(parsed.len());
        self.lines.extend(parsed.drain(..));
    }
}

/// Incremental splitter turning raw text chunks into logical lines.
///
/// Feed it chunks arriving at arbitrary byte boundaries; complete lines are
/// appended to the caller's buffer with `\r\n`/`\n` terminators removed and
/// blank-after-trim lines skipped.
pub struct LineScanner {
    buffer: String,
    read_offset: usize,
}

impl LineScanner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
        }
    }

    /// Feed raw text and append complete lines into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<String>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            if !line.trim().is_empty() {
                out.push(line.to_string());
            }
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush an unterminated final line at end of stream.
    pub fn finish_into(&mut self, out: &mut Vec<String>) {
        if self.read_offset < self.buffer.len() {
            let mut line = &self.buffer[self.read_offset..];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            if !line.trim().is_empty() {
                out.push(line.to_string());
            }
        }
        self.buffer.clear();
        self.read_offset = 0;
    }
}

impl Default for LineScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a byte stream into logical SSE lines using [`LineScanner`].
///
/// Bytes arriving from an HTTP response body are decoded as UTF-8 (partial
/// code points are buffered across chunks) and complete non-blank lines are
/// yielded in arrival order. A read error terminates the sequence; the
/// retry engine interprets termination without a prior finish reason as a
/// dropped stream.
pub fn sse_line_stream<S, E>(byte_stream: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Debug + Send + 'static,
{
    use futures_util::StreamExt;

    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            LineScanner::new(),
            Vec::<u8>::new(),
            Vec::<String>::with_capacity(8),
            PendingLines::with_capacity(8),
            false,
        ),
        |(mut stream, mut scanner, mut remainder, mut parsed, mut pending, mut ended)| async move {
            loop {
                if let Some(line) = pending.pop_front() {
                    return Some((line, (stream, scanner, remainder, parsed, pending, ended)));
                }
                if ended {
                    return None;
                }

                match stream.as_mut().next().await {
                    Some(Ok(bytes)) => {
                        feed_bytes(&mut scanner, &mut remainder, &bytes, &mut parsed);
                    }
                    Some(Err(err)) => {
                        // Unlike clean EOF, a read error does not flush the
                        // partial tail line.
                        tracing::debug!(error = ?err, "error reading upstream stream; ending line sequence");
                        ended = true;
                    }
                    None => {
                        scanner.finish_into(&mut parsed);
                        ended = true;
                    }
                }
                pending.extend_from_vec(&mut parsed);
            }
        },
    )
}

fn feed_bytes(
    scanner: &mut LineScanner,
    remainder: &mut Vec<u8>,
    bytes: &[u8],
    parsed: &mut Vec<String>,
) {
    if remainder.is_empty() {
        match std::str::from_utf8(bytes) {
            Ok(text) => scanner.feed_into(text, parsed),
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                let text = unsafe { std::str::from_utf8_unchecked(&bytes[..valid_up_to]) };
                scanner.feed_into(text, parsed);
                remainder.extend_from_slice(&bytes[valid_up_to..]);
            }
        }
        return;
    }

    remainder.extend_from_slice(bytes);
    match std::str::from_utf8(remainder.as_slice()) {
        Ok(text) => {
            scanner.feed_into(text, parsed);
            remainder.clear();
        }
        Err(e) => {
            let valid_up_to = e.valid_up_to();
            // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
            let text = unsafe { std::str::from_utf8_unchecked(&remainder[..valid_up_to]) };
            scanner.feed_into(text, parsed);
            if valid_up_to > 0 {
                if valid_up_to == remainder.len() {
                    remainder.clear();
                } else {
                    let remain_len = remainder.len() - valid_up_to;
                    remainder.copy_within(valid_up_to.., 0);
                    remainder.truncate(remain_len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn feed_all(chunks: &[&str]) -> Vec<String> {
        let mut scanner = LineScanner::new();
        let mut out = Vec::new();
        for chunk in chunks {
            scanner.feed_into(chunk, &mut out);
        }
        scanner.finish_into(&mut out);
        out
    }

    #[test]
    fn test_splits_on_newlines() {
        let lines = feed_all(&["data: a\ndata: b\n"]);
        assert_eq!(lines, vec!["data: a", "data: b"]);
    }

    #[test]
    fn test_skips_blank_lines() {
        let lines = feed_all(&["data: a\n\n\ndata: b\n   \n"]);
        assert_eq!(lines, vec!["data: a", "data: b"]);
    }

    #[test]
    fn test_strips_carriage_returns() {
        let lines = feed_all(&["data: a\r\n\r\ndata: b\r\n"]);
        assert_eq!(lines, vec!["data: a", "data: b"]);
    }

    #[test]
    fn test_reassembles_split_lines() {
        let lines = feed_all(&["data: hel", "lo\n"]);
        assert_eq!(lines, vec!["data: hello"]);
    }

    #[test]
    fn test_flushes_unterminated_tail() {
        let lines = feed_all(&["data: tail"]);
        assert_eq!(lines, vec!["data: tail"]);
    }

    #[test]
    fn test_preserves_non_data_lines_verbatim() {
        let lines = feed_all(&[": comment\nevent: error\nid: 7\n"]);
        assert_eq!(lines, vec![": comment", "event: error", "id: 7"]);
    }

    #[tokio::test]
    async fn test_stream_yields_lines_in_order() {
        let source = futures_util::stream::iter(vec![
            Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(b"data: one\n\nda")),
            Ok(Bytes::from_static(b"ta: two\n\n")),
        ]);
        let lines: Vec<String> = sse_line_stream(source).collect().await;
        assert_eq!(lines, vec!["data: one", "data: two"]);
    }

    #[tokio::test]
    async fn test_stream_ends_on_read_error() {
        let source = futures_util::stream::iter(vec![
            Ok::<Bytes, &str>(Bytes::from_static(b"data: first\n\n")),
            Err("connection reset"),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ]);
        let lines: Vec<String> = sse_line_stream(source).collect().await;
        assert_eq!(lines, vec!["data: first"]);
    }

    #[tokio::test]
    async fn test_stream_handles_split_utf8() {
        // "é" is 0xC3 0xA9; split it across chunks.
        let source = futures_util::stream::iter(vec![
            Ok::<Bytes, std::convert::Infallible>(Bytes::from(vec![
                b'd', b'a', b't', b'a', b':', b' ', 0xC3,
            ])),
            Ok(Bytes::from(vec![0xA9, b'\n'])),
        ]);
        let lines: Vec<String> = sse_line_stream(source).collect().await;
        assert_eq!(lines, vec!["data: \u{e9}"]);
    }
}
