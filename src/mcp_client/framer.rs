//! Incremental JSON framer for server stdout.
//!
//! Servers write JSON-RPC messages to stdout, but the pipe delivers them in
//! arbitrary chunks: one message may span several reads and one read may carry
//! several messages (plus log noise). `JsonFramer` reassembles complete
//! top-level `{…}` objects from those chunks.
//!
//! The scanner tracks string literals and escapes, so braces inside strings
//! never move the depth counter. State survives across `push` calls, so each
//! byte is scanned exactly once.
//!
//! Servers write one message per line, so an object still open when a new
//! line starts with `{` was noise (`config {missing close`) and is abandoned
//! there. An object that outgrows the size limit is dropped as well.

use std::collections::VecDeque;

use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of a single stdout read.
const READ_CHUNK: usize = 8 * 1024;

/// Largest object the framer will buffer.
pub const MAX_OBJECT_BYTES: usize = 16 * 1024 * 1024;

// ─── JsonFramer ─────────────────────────────────────────────────────────────

/// Reassembles complete JSON objects from a byte stream.
#[derive(Debug)]
pub struct JsonFramer {
    /// Unconsumed bytes. Kept as bytes so split UTF-8 sequences survive.
    buf: Vec<u8>,
    /// Scan cursor into `buf`.
    pos: usize,
    /// Offset of the `{` that opened the object being scanned.
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    max_object_bytes: usize,
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::with_limit(MAX_OBJECT_BYTES)
    }
}

impl JsonFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framer that drops any object larger than `max_object_bytes`.
    pub fn with_limit(max_object_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            start: None,
            depth: 0,
            in_string: false,
            escaped: false,
            max_object_bytes: max_object_bytes.max(2),
        }
    }

    /// Feed a chunk and return every object it completed, in order.
    ///
    /// Partial objects are retained until a later chunk closes them. Bytes
    /// outside any object are skipped. A balanced candidate that is not valid
    /// JSON cannot be repaired by more input, so it is dropped with a warning.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<serde_json::Value> {
        self.buf.extend_from_slice(chunk);
        let mut complete = Vec::new();

        while self.pos < self.buf.len() {
            let byte = self.buf[self.pos];

            match self.start {
                None => {
                    if byte == b'{' {
                        self.open_object(self.pos);
                    }
                }
                Some(start)
                    if byte == b'{' && self.pos > start && self.buf[self.pos - 1] == b'\n' =>
                {
                    tracing::warn!(
                        bytes = self.pos - start,
                        "discarding unterminated JSON before a new message line"
                    );
                    self.open_object(self.pos);
                }
                Some(start) if self.pos - start >= self.max_object_bytes => {
                    tracing::warn!(
                        limit = self.max_object_bytes,
                        "JSON object exceeds size limit, dropped"
                    );
                    self.reset_object();
                }
                Some(start) => {
                    if self.in_string {
                        if self.escaped {
                            self.escaped = false;
                        } else if byte == b'\\' {
                            self.escaped = true;
                        } else if byte == b'"' {
                            self.in_string = false;
                        }
                    } else {
                        match byte {
                            b'"' => self.in_string = true,
                            b'{' => self.depth += 1,
                            b'}' => {
                                self.depth -= 1;
                                if self.depth == 0 {
                                    let parsed = serde_json::from_slice::<serde_json::Value>(
                                        &self.buf[start..=self.pos],
                                    );
                                    match parsed {
                                        Ok(value) => complete.push(value),
                                        Err(e) => {
                                            tracing::warn!(
                                                error = %e,
                                                bytes = self.pos + 1 - start,
                                                "dropping balanced but invalid JSON object"
                                            );
                                        }
                                    }
                                    self.start = None;
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            self.pos += 1;
        }

        self.compact();
        complete
    }

    fn open_object(&mut self, at: usize) {
        self.start = Some(at);
        self.depth = 1;
        self.in_string = false;
        self.escaped = false;
    }

    fn reset_object(&mut self) {
        self.start = None;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }

    /// Number of buffered bytes not yet part of an emitted object.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything before the open object (or everything, if none).
    fn compact(&mut self) {
        let keep_from = self.start.unwrap_or(self.buf.len());
        if keep_from == 0 {
            return;
        }
        self.buf.drain(..keep_from);
        self.pos -= keep_from;
        if let Some(start) = self.start.as_mut() {
            *start = 0;
        }
    }
}

// ─── Stream adapter ─────────────────────────────────────────────────────────

struct FrameState<R> {
    reader: R,
    framer: JsonFramer,
    ready: VecDeque<serde_json::Value>,
    chunk: Vec<u8>,
    eof: bool,
}

/// Turn an async reader into a lazy stream of complete JSON objects.
///
/// The stream ends when the reader reaches EOF or fails; a trailing partial
/// object is discarded at that point.
pub fn framed_messages<R>(reader: R) -> impl Stream<Item = serde_json::Value>
where
    R: AsyncRead + Unpin,
{
    let state = FrameState {
        reader,
        framer: JsonFramer::new(),
        ready: VecDeque::new(),
        chunk: vec![0u8; READ_CHUNK],
        eof: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(value) = state.ready.pop_front() {
                return Some((value, state));
            }
            if state.eof {
                if state.framer.pending_bytes() > 0 {
                    tracing::debug!(
                        bytes = state.framer.pending_bytes(),
                        "stream closed with an incomplete JSON object"
                    );
                }
                return None;
            }

            match state.reader.read(&mut state.chunk).await {
                Ok(0) => state.eof = true,
                Ok(n) => {
                    let FrameState {
                        framer,
                        ready,
                        chunk,
                        ..
                    } = &mut state;
                    ready.extend(framer.push(&chunk[..n]));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "read error on framed stream");
                    state.eof = true;
                }
            }
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
