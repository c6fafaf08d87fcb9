//! Signaling core for the Warp-LAN transfer server.
//!
//! The [`Hub`] owns the registry of live clients and rendezvous rooms,
//! serializes membership changes and message routing, and sweeps expired
//! rooms. Each connection gets a read task and a write task
//! ([`run_session`]) joined by a bounded outbox; a slow peer loses its
//! own messages instead of stalling the hub. Admission of new
//! connections is gated by the sliding-window [`RateLimiter`].

mod client;
mod hub;
mod rate_limit;
mod room;

pub use client::run_session;
pub use hub::{Hub, HubSnapshot};
pub use rate_limit::RateLimiter;

/// Outbox capacity per client. Routing to a client whose outbox is full
/// drops the message for that recipient only.
pub const OUTBOX_CAPACITY: usize = 256;
