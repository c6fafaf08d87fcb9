use std::time::Duration;

/// Time allowed to write a single WebSocket frame.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read deadline: if no pong arrives within this window the connection
/// is considered dead and torn down.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often heartbeat pings are sent (90% of the pong wait).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum inbound message size (64 KiB). Signaling frames are small;
/// anything larger is a protocol violation and fatal to the connection.
pub const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Rooms expire this long after creation, regardless of activity.
/// The rendezvous code is the secret, and the secret expires.
pub const ROOM_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// How often the hub sweeps for expired rooms.
pub const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
