//! Server-sent-events transcoder.
//!
//! Contract:
//! - Input is any byte stream (`Result<Bytes, E>` items), e.g. a reqwest body.
//! - Output is a lazy, finite stream of [`SseEvent`]s, one per SSE message.
//! - Malformed lines are dropped; a message with no recognised field yields nothing.
//! - A trailing partial message is held across chunks and flushed at end of input.
//! - A transport error is yielded once as `Err(ChatStreamError::Transport)`; the stream
//!   ends after it.
//! - Cancellation (token or [`SseTranscoder::cancel`]) ends the stream with `None`, never
//!   with an error, and drops the inner reader exactly once.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{ChatStreamError, CoreResult};

/// Literal payload that terminates an OpenAI-style completion stream.
pub const DONE_MARKER: &str = "[DONE]";

/// One parsed SSE message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    /// True when this message carries the end-of-stream marker.
    pub fn is_done(&self) -> bool {
        self.data.as_deref().map(str::trim) == Some(DONE_MARKER)
    }
}

/// Separators used to cut the text stream. Defaults follow `text/event-stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseOptions {
    /// Boundary between messages.
    pub stream_separator: String,
    /// Boundary between lines inside one message.
    pub part_separator: String,
    /// Boundary between field name and value inside one line.
    pub kv_separator: String,
    /// Rewrite `\r\n` to `\n` before splitting.
    pub normalize_crlf: bool,
}

impl SseOptions {
    /// Empty separators would never advance the buffer.
    pub fn validate(&self) -> CoreResult<()> {
        for (name, sep) in [
            ("stream_separator", &self.stream_separator),
            ("part_separator", &self.part_separator),
            ("kv_separator", &self.kv_separator),
        ] {
            if sep.is_empty() {
                return Err(ChatStreamError::Validation(format!("sse {name} is empty")));
            }
        }
        Ok(())
    }
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            stream_separator: "\n\n".into(),
            part_separator: "\n".into(),
            kv_separator: ":".into(),
            normalize_crlf: true,
        }
    }
}

/// Incremental UTF-8 decoder: a code point split across chunks is carried over
/// instead of being replaced.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&rest[..valid]) {
                        out.push_str(s);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            // incomplete sequence at the end: wait for more bytes
                            self.carry = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        String::from_utf8_lossy(&std::mem::take(&mut self.carry)).into_owned()
    }
}

/// Parse one message block into an event. Returns `None` when no recognised
/// field is present.
pub fn parse_message(block: &str, opts: &SseOptions) -> Option<SseEvent> {
    if block.trim().is_empty() {
        return None;
    }
    let mut ev = SseEvent::default();
    let mut any = false;
    for line in block.split(opts.part_separator.as_str()) {
        let Some(sep) = line.find(opts.kv_separator.as_str()) else {
            continue;
        };
        let key = line[..sep].trim();
        if key.is_empty() {
            continue;
        }
        let value = line[sep + opts.kv_separator.len()..].trim();
        match key {
            "data" => {
                // repeated data lines join with '\n'
                match ev.data.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(value);
                    }
                    None => ev.data = Some(value.to_string()),
                }
            }
            "event" => ev.event = Some(value.to_string()),
            "id" => ev.id = Some(value.to_string()),
            "retry" => match value.parse::<u64>() {
                Ok(ms) => ev.retry = Some(ms),
                Err(_) => continue,
            },
            _ => continue,
        }
        any = true;
    }
    any.then_some(ev)
}

/// Byte stream → [`SseEvent`] stream.
pub struct SseTranscoder<S> {
    inner: Option<S>,
    decoder: Utf8Decoder,
    buf: String,
    ready: VecDeque<SseEvent>,
    opts: SseOptions,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    finished: bool,
    released: bool,
}

impl<S> fmt::Debug for SseTranscoder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseTranscoder")
            .field("buffered_bytes", &self.buf.len())
            .field("ready", &self.ready.len())
            .field("finished", &self.finished)
            .field("released", &self.released)
            .finish()
    }
}

impl<S> SseTranscoder<S> {
    pub fn new(inner: S) -> Self {
        Self::build(inner, SseOptions::default())
    }

    /// Fails with `Validation` when a separator is empty.
    pub fn with_options(inner: S, opts: SseOptions) -> CoreResult<Self> {
        opts.validate()?;
        Ok(Self::build(inner, opts))
    }

    fn build(inner: S, opts: SseOptions) -> Self {
        Self {
            inner: Some(inner),
            decoder: Utf8Decoder::default(),
            buf: String::new(),
            ready: VecDeque::new(),
            opts,
            cancelled: None,
            finished: false,
            released: false,
        }
    }

    /// Stop iterating as soon as `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancelled = Some(Box::pin(token.cancelled_owned()));
        self
    }

    /// Stop iteration and drop the underlying reader. Returns `false` if the
    /// reader was already released.
    pub fn cancel(&mut self) -> bool {
        self.finished = true;
        self.ready.clear();
        self.release()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.inner = None;
        true
    }

    fn push_text(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.opts.normalize_crlf && self.buf.contains("\r\n") {
            self.buf = self.buf.replace("\r\n", "\n");
        }
        let sep_len = self.opts.stream_separator.len();
        while let Some(idx) = self.buf.find(self.opts.stream_separator.as_str()) {
            let block: String = self.buf.drain(..idx + sep_len).collect();
            if let Some(ev) = parse_message(&block[..idx], &self.opts) {
                self.ready.push_back(ev);
            }
        }
    }

    fn flush_tail(&mut self) {
        let tail = self.decoder.finish();
        if !tail.is_empty() {
            self.push_text(&tail);
        }
        let rest = std::mem::take(&mut self.buf);
        if let Some(ev) = parse_message(&rest, &self.opts) {
            self.ready.push_back(ev);
        }
    }
}

impl<S, E> Stream for SseTranscoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    type Item = CoreResult<SseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(fut) = this.cancelled.as_mut()
                && fut.as_mut().poll(cx).is_ready()
            {
                this.cancelled = None;
                if !this.released {
                    tracing::debug!("sse transcoder cancelled");
                }
                this.cancel();
                return Poll::Ready(None);
            }

            if let Some(ev) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            let Some(inner) = this.inner.as_mut() else {
                this.finished = true;
                return Poll::Ready(None);
            };

            match inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let text = this.decoder.decode(&chunk);
                    this.push_text(&text);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    this.ready.clear();
                    this.release();
                    return Poll::Ready(Some(Err(ChatStreamError::Transport(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.flush_tail();
                    this.finished = true;
                    this.release();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
