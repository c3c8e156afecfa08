//! Inference — the language model as a capability.
//!
//! This module handles all communication with the model endpoint:
//! - The `ModelCapability` seam the conversation loop depends on
//! - Streaming chat completions against OpenAI-compatible APIs
//! - SSE stream parsing with native tool call accumulation
//! - Fallback chain management
//!
//! Switching models is a config change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{FragmentStream, InferenceClient, ModelCapability};
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use types::{ChatMessage, InvalidToolCall, ModelFragment, Role, ToolCall, ToolDefinition};
