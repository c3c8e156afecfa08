//! Shared types for the agent core.
//!
//! The conversation transcript, inbound requests, and loop outcomes.

use serde::{Deserialize, Serialize};

use crate::inference::types::{ChatMessage, Role, ToolCall, ToolCallResponse};

// ─── Transcript ─────────────────────────────────────────────────────────────

/// Result of one tool call, keyed by the call id it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    /// Qualified tool name the call targeted.
    pub name: String,
    /// Normalized text (or `Error: …` text when the call failed).
    pub content: String,
    pub is_error: bool,
}

/// One entry of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptMessage {
    User {
        text: String,
    },
    Model {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    /// Every result of a model turn, in call order.
    ToolResults {
        results: Vec<ToolResult>,
    },
}

/// Ordered dialog of one conversation. Lives only as long as the loop runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<TranscriptMessage>,
}

impl Transcript {
    /// Start a transcript with the user's prompt.
    pub fn new(prompt: &str) -> Self {
        Self {
            messages: vec![TranscriptMessage::User {
                text: prompt.to_string(),
            }],
        }
    }

    /// Record a model turn that requested tools. Empty text is omitted.
    pub fn push_model_turn(&mut self, text: &str, tool_calls: Vec<ToolCall>) {
        let text = (!text.trim().is_empty()).then(|| text.to_string());
        self.messages
            .push(TranscriptMessage::Model { text, tool_calls });
    }

    pub fn push_tool_results(&mut self, results: Vec<ToolResult>) {
        self.messages.push(TranscriptMessage::ToolResults { results });
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Map to OpenAI chat messages, with `system_prompt` first.
    ///
    /// Each tool result becomes its own `tool` role message answering its
    /// call id, which is how the Chat Completions API pairs them.
    pub fn to_chat_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !system_prompt.is_empty() {
            out.push(ChatMessage::system(system_prompt));
        }

        for message in &self.messages {
            match message {
                TranscriptMessage::User { text } => out.push(ChatMessage::user(text)),
                TranscriptMessage::Model { text, tool_calls } => out.push(ChatMessage {
                    role: Role::Assistant,
                    content: text.clone(),
                    tool_call_id: None,
                    tool_calls: (!tool_calls.is_empty())
                        .then(|| tool_calls.iter().map(ToolCallResponse::from).collect()),
                }),
                TranscriptMessage::ToolResults { results } => {
                    out.extend(results.iter().map(|r| ChatMessage {
                        role: Role::Tool,
                        content: Some(r.content.clone()),
                        tool_call_id: Some(r.call_id.clone()),
                        tool_calls: None,
                    }));
                }
            }
        }
        out
    }
}

// ─── Requests and Outcomes ──────────────────────────────────────────────────

/// One natural-language request to run through the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    pub request_id: String,
    /// Key progress events are reported under.
    pub task_id: String,
    pub prompt: String,
}

/// How a conversation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationOutcome {
    /// The model answered without requesting tools.
    Done { text: String, iterations: u32 },
    /// The iteration ceiling was hit first.
    Incomplete {
        text: String,
        iterations: u32,
        last_percent: u8,
        message: String,
    },
}

impl ConversationOutcome {
    /// Text to hand back to the requester.
    pub fn text(&self) -> &str {
        match self {
            Self::Done { text, .. } | Self::Incomplete { text, .. } => text,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn iterations(&self) -> u32 {
        match self {
            Self::Done { iterations, .. } | Self::Incomplete { iterations, .. } => *iterations,
        }
    }
}

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate to at most `max_bytes` bytes on a char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ──────────────────────────────────────────────────────────────────
