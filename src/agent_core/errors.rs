//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that end a conversation without an answer.
///
/// Tool failures are not here: they are folded into the transcript and the
/// model decides what to do about them.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model could not be asked (every endpoint in the chain failed).
    #[error("model unavailable: {0}")]
    Model(#[from] InferenceError),

    /// The requester cancelled the conversation.
    #[error("conversation '{request_id}' cancelled")]
    Cancelled { request_id: String },

    /// The request cannot be run (e.g., an empty prompt).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}
