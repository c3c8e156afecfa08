//! Wire messages exchanged with bridge clients.
//!
//! Inbound frames are `{"type": "request", ...}` or `{"type": "cancel", ...}`;
//! every reply carries an RFC 3339 timestamp.

use serde::{Deserialize, Serialize};

use super::errors::BridgeError;
use crate::agent_core::tool_prefilter::find_issue_key;
use crate::agent_core::ConversationOutcome;

// ─── Inbound ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Start a conversation. A missing `requestId` is assigned by the server.
    Request {
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
        prompt: String,
        #[serde(default, rename = "taskId")]
        task_id: Option<String>,
    },
    /// Cancel a running conversation of this connection.
    Cancel {
        #[serde(rename = "requestId")]
        request_id: String,
    },
}

/// Parse one text frame.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, BridgeError> {
    serde_json::from_str(text).map_err(|e| BridgeError::MalformedMessage {
        reason: e.to_string(),
    })
}

/// Key progress is reported under: the explicit task id, else
/// `{issue key}:{request id}` for the first issue key in the prompt, else the
/// request id.
///
/// Derived ids are unique per request, so two requests about one issue never
/// share a progress sequence.
pub fn derive_task_id(explicit: Option<&str>, prompt: &str, request_id: &str) -> String {
    if let Some(explicit) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return explicit.to_string();
    }
    match find_issue_key(prompt) {
        Some(key) => format!("{key}:{request_id}"),
        None => request_id.to_string(),
    }
}

// ─── Outbound ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        response: String,
        /// False when the iteration limit was hit before a final answer.
        complete: bool,
        timestamp: String,
    },
    Error {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
        timestamp: String,
    },
}

impl OutboundMessage {
    pub fn response(request_id: &str, outcome: &ConversationOutcome) -> Self {
        let response = match outcome {
            ConversationOutcome::Done { text, .. } => text.clone(),
            ConversationOutcome::Incomplete { text, message, .. } if text.is_empty() => {
                message.clone()
            }
            ConversationOutcome::Incomplete { text, message, .. } => {
                format!("{text}\n\n({message})")
            }
        };
        Self::Response {
            request_id: request_id.to_string(),
            response,
            complete: outcome.is_complete(),
            timestamp: now(),
        }
    }

    pub fn error(request_id: Option<&str>, error: impl Into<String>) -> Self {
        Self::Error {
            request_id: request_id.map(str::to_string),
            error: error.into(),
            timestamp: now(),
        }
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::MalformedMessage {
            reason: format!("failed to serialize reply: {e}"),
        })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
