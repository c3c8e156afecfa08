//! Agent Core — the conversation loop and what it reports.
//!
//! Submodules:
//! - `orchestrator`: Bounded agent loop (model turn → tools → model turn)
//! - `tool_prefilter`: Keyword pre-filter choosing the tools offered per turn
//! - `progress`: Monotonic progress events published to an external monitor
//! - `types`: Transcript, requests and outcomes
//! - `errors`: Agent-level error types

pub mod errors;
pub mod orchestrator;
pub mod progress;
pub mod tool_prefilter;
pub mod types;

// Re-exports for convenience
pub use errors::AgentError;
pub use orchestrator::{LoopConfig, Orchestrator};
pub use progress::{
    HttpProgressSink, LogProgressSink, ProgressBroadcaster, ProgressEvent, ProgressSink,
    ProgressStatus,
};
pub use tool_prefilter::{KeywordGroup, ToolPrefilter};
pub use types::{ConversationOutcome, ConversationRequest, Transcript};
