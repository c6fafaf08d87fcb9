use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::time::Instant;

use warplan_protocol::constants::ROOM_EXPIRY;

use crate::client::Sender;

/// A rendezvous set: the clients that presented the same code.
///
/// Rooms hold no tasks of their own; all membership changes happen under
/// the hub's registry lock. The member lock is always acquired after it.
pub(crate) struct Room {
    pub(crate) created_at: Instant,
    pub(crate) members: RwLock<HashMap<String, Sender>>,
}

impl Room {
    pub(crate) fn new() -> Self {
        Self {
            created_at: Instant::now(),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Expiry is anchored to creation time, not last activity.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > ROOM_EXPIRY
    }
}
