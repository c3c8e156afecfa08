//! Bridge — WebSocket front door for conversation requests.
//!
//! - `protocol`: inbound/outbound JSON frames
//! - `server`: listener and per-connection handling
//! - `errors`: bridge error types

pub mod errors;
pub mod protocol;
pub mod server;

pub use errors::BridgeError;
pub use protocol::{InboundMessage, OutboundMessage};
pub use server::BridgeServer;
