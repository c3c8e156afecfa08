//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Splits an HTTP body byte stream on SSE boundaries (`data: …\n\n`),
//! parses each event as a `ChatCompletionChunk`, emits text deltas as they
//! arrive, and accumulates tool call fragments until the model finishes.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, InvalidToolCall, ModelFragment, ToolCall};

// ─── SSE stream parser ───────────────────────────────────────────────────────

/// Parse an SSE byte stream into `ModelFragment`s.
///
/// Generic over the chunk type so it runs on `reqwest::Response::bytes_stream()`
/// in production and on plain vectors in tests. Bytes are buffered as bytes,
/// so a multi-byte character split across network chunks stays intact.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<ModelFragment, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (byte_stream, StreamState::default(), Vec::<u8>::new()),
        |(mut byte_stream, mut state, mut buffer)| async move {
            loop {
                if let Some(fragment) = state.ready.pop_front() {
                    return Some((fragment, (byte_stream, state, buffer)));
                }
                if state.done {
                    return None;
                }

                // Process a complete SSE event if one is buffered
                if let Some(event_end) = find_event_end(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    let event = String::from_utf8_lossy(&event[..event_end]).into_owned();
                    state.process_event(&event);
                    continue;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.as_ref().iter().filter(|b| **b != b'\r'));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, state, buffer),
                        ));
                    }
                    None => {
                        // Servers may omit the trailing blank line
                        let rest = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        if !rest.trim().is_empty() {
                            state.process_event(rest.trim());
                        }
                        state.finish();
                    }
                }
            }
        },
    )
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// A tool call being assembled from deltas.
#[derive(Debug, Default)]
struct PendingToolCall {
    index: u32,
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Mutable state for accumulating tool call fragments across SSE events.
#[derive(Debug, Default)]
struct StreamState {
    pending: Vec<PendingToolCall>,
    ready: VecDeque<Result<ModelFragment, InferenceError>>,
    done: bool,
}

impl StreamState {
    /// Process a single SSE event (may contain several `data:` lines).
    fn process_event(&mut self, event: &str) {
        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    self.finish();
                    return;
                }
                data_content.push_str(data);
            }
            // Comments, `event:` and `id:` lines carry nothing we use
        }

        if data_content.is_empty() {
            return;
        }

        match serde_json::from_str::<ChatCompletionChunk>(&data_content) {
            Ok(chunk) => self.process_chunk(chunk),
            Err(e) => {
                self.ready.push_back(Err(InferenceError::StreamError {
                    reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
                }));
                self.done = true;
            }
        }
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) {
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                self.ready.push_back(Ok(ModelFragment::Text(content)));
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index.unwrap_or(0);
            let (name, args) = match tc.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };

            let pending = match self.pending.iter_mut().position(|p| p.index == index) {
                Some(pos) => &mut self.pending[pos],
                None => {
                    self.pending.push(PendingToolCall {
                        index,
                        ..Default::default()
                    });
                    let last = self.pending.len() - 1;
                    &mut self.pending[last]
                }
            };

            if let Some(id) = tc.id {
                pending.id = Some(id);
            }
            if let Some(name) = name {
                pending.name.push_str(&name);
            }
            if let Some(args) = args {
                pending.arguments.push_str(&args);
            }
        }

        // Some runtimes finish tool turns with "stop"; flush on any reason
        if choice.finish_reason.is_some() {
            self.flush_tool_calls();
        }
    }

    /// Emit every accumulated call in index order.
    ///
    /// A call that does not parse becomes `InvalidToolCall`; the calls after
    /// it are still emitted.
    fn flush_tool_calls(&mut self) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| p.index);
        for call in pending {
            let fragment = match parse_tool_call(call.id.as_deref(), &call.name, &call.arguments) {
                Ok(parsed) => ModelFragment::ToolCall(parsed),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "model sent an unparsable tool call");
                    ModelFragment::InvalidToolCall(InvalidToolCall {
                        id: call_id(call.id.as_deref()),
                        name: call.name,
                        raw_arguments: call.arguments,
                        reason: e.to_string(),
                    })
                }
            };
            self.ready.push_back(Ok(fragment));
        }
    }

    fn finish(&mut self) {
        self.flush_tool_calls();
        self.done = true;
    }
}

/// Build a `ToolCall` from accumulated fragments.
///
/// Empty arguments mean "no arguments" and become `{}`.
pub fn parse_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    if name.is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let call_id = call_id(id);

    let arguments = if arguments_json.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(arguments_json).map_err(|e| InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: format!("invalid JSON arguments: {e}"),
        })?
    };

    Ok(ToolCall {
        id: call_id,
        name: name.to_string(),
        arguments,
    })
}

/// The model's call id, or a generated one.
fn call_id(id: Option<&str>) -> String {
    id.filter(|id| !id.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
