//! Streaming pass-through with incremental usage extraction
//!
//! `TrackedStream` yields every upstream chunk unchanged while feeding a copy
//! into `FrameParser`, which reassembles server-sent-event lines across chunk
//! boundaries and pulls usage and content out of each `data:` frame. Parsing
//! never holds back or alters bytes; a frame that fails to parse is counted
//! and skipped.
//!
//! When the stream finalizes (terminator frame, end of body, upstream error,
//! or the consumer dropping the body) a `StreamSummary` is sent over a
//! oneshot channel exactly once.

use crate::error::GatewayError;
use crate::usage::Usage;
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What the tracker learned from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub usage: Usage,
    /// Concatenated text of all text blocks and deltas.
    pub text: String,
    /// Number of `data:` frames seen (terminators excluded).
    pub frames: u64,
    pub parse_errors: u64,
    pub saw_content: bool,
    /// A terminator (`message_stop` or `[DONE]`) was seen.
    pub complete: bool,
    /// Message of an in-band `error` event or a transport failure.
    pub error: Option<String>,
}

impl StreamSummary {
    /// Neither content nor usage was observed.
    pub fn is_empty(&self) -> bool {
        !self.saw_content && self.usage.is_zero()
    }
}

/// Longest line the parser buffers. Longer lines are counted as parse
/// errors and skipped up to the next newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental server-sent-event parser.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already known to hold no newline.
    scanned: usize,
    /// Skipping the rest of an oversized line.
    discarding: bool,
    summary: StreamSummary,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; every complete line in the buffer is processed.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.summary.complete {
            return;
        }
        let mut chunk = chunk;
        if self.discarding {
            let Some(newline) = chunk.iter().position(|&b| b == b'\n') else {
                return;
            };
            self.discarding = false;
            chunk = &chunk[newline + 1..];
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            self.process_line(&buffer[start..end]);
            start = end + 1;
            from = start;
            if self.summary.complete {
                start = buffer.len();
                break;
            }
        }
        buffer.drain(..start);

        if buffer.len() > MAX_LINE_BYTES {
            self.summary.parse_errors += 1;
            warn!(bytes = buffer.len(), "dropping oversized stream line");
            buffer.clear();
            self.discarding = true;
        }
        self.scanned = buffer.len();
        self.buffer = buffer;
    }

    /// Process a trailing line that arrived without a final newline.
    pub fn finish(&mut self) {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() && !self.summary.complete {
            self.process_line(&rest);
        }
    }

    /// Record a transport failure that ended the stream.
    pub fn record_error(&mut self, message: String) {
        self.summary.error = Some(message);
    }

    pub fn is_complete(&self) -> bool {
        self.summary.complete
    }

    pub fn summary(&self) -> StreamSummary {
        self.summary.clone()
    }

    fn process_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(data) = line.strip_prefix(b"data:") else {
            // event:, id:, retry:, comments and blank separators
            return;
        };
        let data = match std::str::from_utf8(data) {
            Ok(s) => s.trim(),
            Err(_) => {
                self.summary.parse_errors += 1;
                return;
            }
        };
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.summary.complete = true;
            return;
        }

        self.summary.frames += 1;
        match serde_json::from_str::<serde_json::Value>(data) {
            Ok(event) => self.apply_event(&event),
            Err(e) => {
                self.summary.parse_errors += 1;
                debug!(error = %e, "unparseable stream frame");
            }
        }
    }

    fn apply_event(&mut self, event: &serde_json::Value) {
        let usage = &mut self.summary.usage;
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(u) = event.get("message").and_then(|m| m.get("usage")) {
                    let start = Usage::from_json(u);
                    usage.input_tokens = start.input_tokens;
                    usage.cache_creation_input_tokens = start.cache_creation_input_tokens;
                    usage.cache_read_input_tokens = start.cache_read_input_tokens;
                    if start.output_tokens > 0 {
                        usage.output_tokens = start.output_tokens;
                    }
                }
            }
            Some("message_delta") => {
                if let Some(u) = event.get("usage") {
                    let delta = Usage::from_json(u);
                    // Delta counts are cumulative; the latest wins.
                    usage.output_tokens = delta.output_tokens;
                    if delta.input_tokens > 0 {
                        usage.input_tokens = delta.input_tokens;
                    }
                    if delta.cache_creation_input_tokens > 0 {
                        usage.cache_creation_input_tokens = delta.cache_creation_input_tokens;
                    }
                    if delta.cache_read_input_tokens > 0 {
                        usage.cache_read_input_tokens = delta.cache_read_input_tokens;
                    }
                }
            }
            Some("content_block_start") => {
                self.summary.saw_content = true;
                if let Some(text) = event
                    .get("content_block")
                    .and_then(|b| b.get("text"))
                    .and_then(|t| t.as_str())
                {
                    self.summary.text.push_str(text);
                }
            }
            Some("content_block_delta") => {
                self.summary.saw_content = true;
                if let Some(text) = event
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                {
                    self.summary.text.push_str(text);
                }
            }
            Some("message_stop") => {
                // The cloud runtime appends its own counters to the stop frame.
                if let Some(metrics) = event.get("amazon-bedrock-invocationMetrics") {
                    let count = |k: &str| metrics.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
                    if usage.input_tokens == 0 {
                        usage.input_tokens = count("inputTokenCount");
                    }
                    if usage.output_tokens == 0 {
                        usage.output_tokens = count("outputTokenCount");
                    }
                }
                self.summary.complete = true;
            }
            Some("error") => {
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream stream error");
                warn!(error_message = message, "upstream sent an in-band error event");
                self.summary.error = Some(message.to_string());
            }
            _ => {}
        }
    }
}

/// Byte-faithful stream wrapper that tracks usage as chunks go by.
pub struct TrackedStream {
    inner: BoxStream<'static, Result<Bytes, GatewayError>>,
    parser: FrameParser,
    detect_empty: bool,
    summary_tx: Option<oneshot::Sender<StreamSummary>>,
    done: bool,
}

impl TrackedStream {
    /// Wrap a chunk stream. With `detect_empty`, a stream that ends having
    /// carried neither content nor usage yields a trailing
    /// `GatewayError::EmptyResponse`.
    pub fn new<S>(inner: S, detect_empty: bool) -> (Self, oneshot::Receiver<StreamSummary>)
    where
        S: Stream<Item = Result<Bytes, GatewayError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let stream = Self {
            inner: inner.boxed(),
            parser: FrameParser::new(),
            detect_empty,
            summary_tx: Some(tx),
            done: false,
        };
        (stream, rx)
    }

    /// Wrap an upstream response body.
    pub fn from_response(
        response: reqwest::Response,
        detect_empty: bool,
    ) -> (Self, oneshot::Receiver<StreamSummary>) {
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GatewayError::Connect(format!("upstream stream failed: {e}"))));
        Self::new(body, detect_empty)
    }

    fn send_summary(&mut self) {
        if let Some(tx) = self.summary_tx.take() {
            // Receiver may be gone; the summary is informational.
            let _ = tx.send(self.parser.summary());
        }
    }
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !this.parser.is_complete() {
                    this.parser.push(&chunk);
                    if this.parser.is_complete() {
                        this.send_summary();
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.parser.record_error(e.to_string());
                this.send_summary();
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.parser.finish();
                this.send_summary();
                this.done = true;
                if this.detect_empty && this.parser.summary.is_empty() {
                    warn!("stream ended with neither content nor usage");
                    return Poll::Ready(Some(Err(GatewayError::EmptyResponse)));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        // Consumer went away mid-stream: report what was seen so far.
        self.send_summary();
    }
}
