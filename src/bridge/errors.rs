//! Bridge error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// A client frame was not a valid bridge message.
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },
}
