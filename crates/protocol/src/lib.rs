//! Wire protocol for the Warp-LAN signaling server.
//!
//! Defines the JSON envelope every peer and the hub exchange over the
//! WebSocket, the message type discriminants, and the transport timing
//! constants. The hub never looks inside `payload`; it is relayed
//! byte-for-byte.

pub mod constants;
pub mod envelope;

// Re-export primary types for convenience.
pub use envelope::{MessageType, SignalingMessage};
