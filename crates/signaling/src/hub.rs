//! The hub: authoritative registry of clients and rooms.
//!
//! Membership changes and routing arrive as commands on a single bounded
//! channel and are processed in arrival order by [`Hub::run`]. Calls that
//! reach the registry from the read path directly (`join_room`,
//! `room_of`) and the health snapshot go through the same reader-writer
//! lock. Room member maps have their own lock, always acquired after the
//! registry lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warplan_protocol::constants::ROOM_SWEEP_INTERVAL;
use warplan_protocol::SignalingMessage;

use crate::client::Sender;
use crate::room::Room;

/// Command backlog the hub will buffer; senders suspend beyond this,
/// never the hub itself.
const COMMAND_CAPACITY: usize = 256;

/// A live client as the hub tracks it. The room membership map is
/// authoritative; `room_id` is the client-side lookup hint.
pub(crate) struct ClientHandle {
    pub(crate) id: String,
    pub(crate) room_id: Option<String>,
    pub(crate) sender: Sender,
    pub(crate) cancel: CancellationToken,
}

/// A command received by the [`Hub`].
enum Command {
    Register {
        client: ClientHandle,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        client_id: String,
    },
    Route {
        message: SignalingMessage,
    },
}

/// The hub has shut down and no longer accepts clients.
#[derive(Debug, thiserror::Error)]
#[error("hub is shut down")]
pub(crate) struct HubClosed;

#[derive(Default)]
struct Registry {
    clients: HashMap<String, ClientHandle>,
    rooms: HashMap<String, Arc<Room>>,
}

/// Point-in-time registry counts for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct HubSnapshot {
    pub active_rooms: usize,
    pub active_clients: usize,
}

pub struct Hub {
    registry: RwLock<Registry>,
    commands: mpsc::Sender<Command>,
    command_rx: std::sync::Mutex<Option<mpsc::Receiver<Command>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            commands: tx,
            command_rx: std::sync::Mutex::new(Some(rx)),
        })
    }

    /// Processes commands in arrival order and sweeps expired rooms,
    /// until cancelled. On cancellation every client's outbox is closed,
    /// which unwinds the per-connection tasks.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the command receiver is single-consumer.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let mut commands = self
            .command_rx
            .lock()
            .unwrap()
            .take()
            .expect("Hub::run called twice");

        let sweeper = {
            let hub = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { hub.sweep_expired_rooms(cancel).await })
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                command = commands.recv() => match command {
                    Some(Command::Register { client, ack }) => {
                        self.handle_register(client).await;
                        let _ = ack.send(());
                    }
                    Some(Command::Unregister { client_id }) => {
                        self.handle_unregister(&client_id).await;
                    }
                    Some(Command::Route { message }) => {
                        self.handle_route(&message).await;
                    }
                    None => break,
                },
            }
        }

        info!("hub shutting down");
        let registry = self.registry.read().await;
        for client in registry.clients.values() {
            client.cancel.cancel();
        }
        drop(registry);
        let _ = sweeper.await;
    }

    /// Registers a client and waits until the hub has processed it, so
    /// the `connected` frame is enqueued before the caller starts the
    /// session pumps.
    pub(crate) async fn register(&self, client: ClientHandle) -> Result<(), HubClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Register {
                client,
                ack: ack_tx,
            })
            .await
            .map_err(|_| HubClosed)?;
        ack_rx.await.map_err(|_| HubClosed)
    }

    /// Signals unregistration. Idempotent; safe after shutdown.
    pub(crate) async fn unregister(&self, client_id: &str) {
        let _ = self
            .commands
            .send(Command::Unregister {
                client_id: client_id.to_string(),
            })
            .await;
    }

    /// Hands a validated, `from`-stamped message to the routing path.
    pub(crate) async fn route(&self, message: SignalingMessage) {
        let _ = self.commands.send(Command::Route { message }).await;
    }

    /// The room the client currently occupies, if any.
    pub(crate) async fn room_of(&self, client_id: &str) -> Option<String> {
        self.registry
            .read()
            .await
            .clients
            .get(client_id)
            .and_then(|c| c.room_id.clone())
    }

    /// Registry counts for `/health`.
    pub async fn snapshot(&self) -> HubSnapshot {
        let registry = self.registry.read().await;
        HubSnapshot {
            active_rooms: registry.rooms.len(),
            active_clients: registry.clients.len(),
        }
    }

    /// Places `client_id` into `room_id`, creating the room on first
    /// join. Existing members are told about the newcomer; the newcomer
    /// is not notified about itself. Re-joining the current room is a
    /// no-op. Called from the read path, so it takes the registry lock
    /// directly rather than going through the command channel.
    pub(crate) async fn join_room(&self, client_id: &str, room_id: &str) {
        let mut registry = self.registry.write().await;

        let (sender, previous) = match registry.clients.get(client_id) {
            Some(client) if client.room_id.as_deref() == Some(room_id) => return,
            Some(client) => (client.sender.clone(), client.room_id.clone()),
            None => {
                warn!(client_id, "join from unknown client");
                return;
            }
        };

        // Leave the previous room first; at most one room per client.
        if let Some(old_id) = previous {
            Self::remove_member(&mut registry, client_id, &old_id).await;
        }

        let room = registry
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!(room_id, "room created");
                Arc::new(Room::new())
            })
            .clone();

        let mut members = room.members.write().await;
        let notice = SignalingMessage::peer_joined(client_id, room_id);
        for (peer_id, peer) in members.iter() {
            if peer_id == client_id {
                continue;
            }
            if peer.send_msg(&notice).is_err() {
                warn!(client_id = %peer_id, "dropping peer-joined: outbox full");
            }
        }
        members.insert(client_id.to_string(), sender);
        let total_clients = members.len();
        drop(members);

        if let Some(client) = registry.clients.get_mut(client_id) {
            client.room_id = Some(room_id.to_string());
        }

        info!(client_id, room_id, total_clients, "client joined room");
    }

    async fn handle_register(&self, client: ClientHandle) {
        let mut registry = self.registry.write().await;
        if client
            .sender
            .send_msg(&SignalingMessage::connected(&client.id))
            .is_err()
        {
            warn!(client_id = %client.id, "dropping connected: outbox closed");
        }
        info!(client_id = %client.id, "client registered");
        registry.clients.insert(client.id.clone(), client);
    }

    async fn handle_unregister(&self, client_id: &str) {
        let mut registry = self.registry.write().await;
        let Some(client) = registry.clients.remove(client_id) else {
            return;
        };
        // Close the outbox; cancellation is idempotent, so a second
        // unregister for the same client is harmless.
        client.cancel.cancel();

        if let Some(room_id) = client.room_id {
            let notice = SignalingMessage::peer_left(client_id, &room_id);
            if let Some(room) = registry.rooms.get(&room_id) {
                let mut members = room.members.write().await;
                members.remove(client_id);
                for (peer_id, peer) in members.iter() {
                    if peer.send_msg(&notice).is_err() {
                        warn!(client_id = %peer_id, "dropping peer-left: outbox full");
                    }
                }
                let empty = members.is_empty();
                drop(members);
                if empty {
                    registry.rooms.remove(&room_id);
                    info!(room_id = %room_id, "room deleted (empty)");
                }
            }
        }
        info!(client_id, "client unregistered");
    }

    async fn handle_route(&self, message: &SignalingMessage) {
        let registry = self.registry.read().await;

        // Direct addressing wins over room broadcast.
        if let Some(to) = message.to.as_deref() {
            match registry.clients.get(to) {
                Some(client) => {
                    if client.sender.send_msg(message).is_err() {
                        warn!(client_id = %to, "dropping message: outbox full");
                    }
                }
                None => warn!(client_id = %to, "dropping message: no such client"),
            }
            return;
        }

        let Some(room_id) = message.room_id.as_deref() else {
            return;
        };
        let Some(room) = registry.rooms.get(room_id) else {
            debug!(room_id, "dropping message: no such room");
            return;
        };
        let members = room.members.read().await;
        for (peer_id, peer) in members.iter() {
            if Some(peer_id.as_str()) == message.from.as_deref() {
                continue; // Never echo back to the sender.
            }
            if peer.send_msg(message).is_err() {
                warn!(client_id = %peer_id, room_id, "dropping broadcast: outbox full");
            }
        }
    }

    /// Removes a member from a room, deleting the room when emptied.
    async fn remove_member(registry: &mut Registry, client_id: &str, room_id: &str) {
        let Some(room) = registry.rooms.get(room_id) else {
            return;
        };
        let mut members = room.members.write().await;
        members.remove(client_id);
        let empty = members.is_empty();
        drop(members);
        if empty {
            registry.rooms.remove(room_id);
            info!(room_id, "room deleted (empty)");
        }
    }

    async fn sweep_expired_rooms(&self, cancel: CancellationToken) {
        let mut ticker = interval(ROOM_SWEEP_INTERVAL);
        ticker.tick().await; // The first tick fires immediately.

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.expire_rooms().await,
            }
        }
    }

    /// One sweep: every room past its lifetime notifies its members and
    /// is deleted. Members stay connected and may rendezvous on a new
    /// code.
    async fn expire_rooms(&self) {
        let now = Instant::now();
        let mut registry = self.registry.write().await;

        let expired: Vec<String> = registry
            .rooms
            .iter()
            .filter(|(_, room)| room.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in expired {
            let Some(room) = registry.rooms.remove(&room_id) else {
                continue;
            };
            let members = room.members.read().await;
            let notice = SignalingMessage::room_expired(&room_id);
            let member_ids: Vec<String> = members.keys().cloned().collect();
            for peer in members.values() {
                let _ = peer.send_msg(&notice);
            }
            drop(members);

            for id in &member_ids {
                if let Some(client) = registry.clients.get_mut(id) {
                    client.room_id = None;
                }
            }

            info!(
                room_id = %room_id,
                age_secs = now.duration_since(room.created_at).as_secs(),
                "room expired and deleted"
            );
        }
    }
}

/// Builds a bare registered-client handle plus the receiving end of its
/// outbox, for exercising the hub without sockets.
#[cfg(test)]
pub(crate) fn test_client(
    id: &str,
) -> (
    ClientHandle,
    mpsc::Receiver<axum::extract::ws::Message>,
) {
    test_client_with_capacity(id, crate::OUTBOX_CAPACITY)
}

#[cfg(test)]
pub(crate) fn test_client_with_capacity(
    id: &str,
    capacity: usize,
) -> (
    ClientHandle,
    mpsc::Receiver<axum::extract::ws::Message>,
) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = ClientHandle {
        id: id.to_string(),
        room_id: None,
        sender: Sender::new(tx),
        cancel: CancellationToken::new(),
    };
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message as WsMessage;
    use std::time::Duration;
    use warplan_protocol::constants::ROOM_EXPIRY;
    use warplan_protocol::MessageType;

    async fn recv_msg(rx: &mut mpsc::Receiver<WsMessage>) -> SignalingMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbox closed");
        match frame {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).expect("invalid json"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    fn try_recv_msg(rx: &mut mpsc::Receiver<WsMessage>) -> Option<SignalingMessage> {
        match rx.try_recv() {
            Ok(WsMessage::Text(text)) => {
                Some(serde_json::from_str(text.as_str()).expect("invalid json"))
            }
            Ok(other) => panic!("unexpected frame: {other:?}"),
            Err(_) => None,
        }
    }

    /// Registers a bare client directly, bypassing the command loop.
    async fn register_direct(hub: &Arc<Hub>, id: &str) -> mpsc::Receiver<WsMessage> {
        let (handle, mut rx) = test_client(id);
        hub.handle_register(handle).await;
        let connected = recv_msg(&mut rx).await;
        assert_eq!(connected.msg_type, MessageType::Connected);
        assert_eq!(connected.client_id.as_deref(), Some(id));
        rx
    }

    #[tokio::test]
    async fn register_sends_connected_first() {
        let hub = Hub::new();
        let _rx = register_direct(&hub, "a").await;
        assert_eq!(hub.snapshot().await.active_clients, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::new();
        let _rx = register_direct(&hub, "a").await;

        hub.handle_unregister("a").await;
        assert_eq!(hub.snapshot().await.active_clients, 0);

        // Second unregister for the same client is a no-op.
        hub.handle_unregister("a").await;
        assert_eq!(hub.snapshot().await.active_clients, 0);
    }

    #[tokio::test]
    async fn join_notifies_existing_members_only() {
        let hub = Hub::new();
        let mut a_rx = register_direct(&hub, "a").await;
        let mut b_rx = register_direct(&hub, "b").await;

        hub.join_room("a", "42-69").await;
        hub.join_room("b", "42-69").await;

        // The first member hears about the second.
        let joined = recv_msg(&mut a_rx).await;
        assert_eq!(joined.msg_type, MessageType::PeerJoined);
        assert_eq!(joined.client_id.as_deref(), Some("b"));
        assert_eq!(joined.room_id.as_deref(), Some("42-69"));

        // The joiner hears nothing about itself.
        assert!(try_recv_msg(&mut b_rx).is_none());
        assert_eq!(hub.snapshot().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn rejoining_same_room_is_a_noop() {
        let hub = Hub::new();
        let mut a_rx = register_direct(&hub, "a").await;
        let _b_rx = register_direct(&hub, "b").await;

        hub.join_room("a", "42-69").await;
        hub.join_room("b", "42-69").await;
        let _ = recv_msg(&mut a_rx).await; // peer-joined for b

        hub.join_room("b", "42-69").await;
        assert!(try_recv_msg(&mut a_rx).is_none(), "no duplicate peer-joined");
        assert_eq!(hub.snapshot().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn switching_rooms_deletes_emptied_room() {
        let hub = Hub::new();
        let _a_rx = register_direct(&hub, "a").await;

        hub.join_room("a", "old-room").await;
        assert_eq!(hub.snapshot().await.active_rooms, 1);

        hub.join_room("a", "new-room").await;
        assert_eq!(hub.snapshot().await.active_rooms, 1);
        assert_eq!(hub.room_of("a").await.as_deref(), Some("new-room"));
    }

    #[tokio::test]
    async fn route_broadcasts_to_room_without_echo() {
        let hub = Hub::new();
        let mut a_rx = register_direct(&hub, "a").await;
        let mut b_rx = register_direct(&hub, "b").await;
        let mut c_rx = register_direct(&hub, "c").await;

        hub.join_room("a", "42-69").await;
        hub.join_room("b", "42-69").await;
        hub.join_room("c", "other").await;
        let _ = recv_msg(&mut a_rx).await; // peer-joined for b

        let msg: SignalingMessage = serde_json::from_str(
            r#"{"type":"offer","from":"a","roomId":"42-69","payload":"SDP_OFFER"}"#,
        )
        .unwrap();
        hub.handle_route(&msg).await;

        let received = recv_msg(&mut b_rx).await;
        assert_eq!(received.msg_type, MessageType::Offer);
        assert_eq!(received.from.as_deref(), Some("a"));
        assert_eq!(received.payload.unwrap().get(), "\"SDP_OFFER\"");

        // No echo to the sender, nothing across rooms.
        assert!(try_recv_msg(&mut a_rx).is_none());
        assert!(try_recv_msg(&mut c_rx).is_none());
    }

    #[tokio::test]
    async fn route_prefers_direct_addressing() {
        let hub = Hub::new();
        let mut a_rx = register_direct(&hub, "a").await;
        let mut b_rx = register_direct(&hub, "b").await;
        let mut c_rx = register_direct(&hub, "c").await;

        hub.join_room("a", "42-69").await;
        hub.join_room("b", "42-69").await;
        hub.join_room("c", "42-69").await;
        while try_recv_msg(&mut a_rx).is_some() {}
        while try_recv_msg(&mut b_rx).is_some() {}

        // Both `to` and `roomId` set: only the addressee receives it.
        let msg: SignalingMessage = serde_json::from_str(
            r#"{"type":"answer","from":"b","to":"a","roomId":"42-69","payload":"SDP_ANSWER"}"#,
        )
        .unwrap();
        hub.handle_route(&msg).await;

        let received = recv_msg(&mut a_rx).await;
        assert_eq!(received.msg_type, MessageType::Answer);
        assert_eq!(received.from.as_deref(), Some("b"));
        assert!(try_recv_msg(&mut b_rx).is_none());
        assert!(try_recv_msg(&mut c_rx).is_none());
    }

    #[tokio::test]
    async fn route_to_unknown_client_is_dropped() {
        let hub = Hub::new();
        let mut a_rx = register_direct(&hub, "a").await;

        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"offer","from":"a","to":"ghost"}"#).unwrap();
        hub.handle_route(&msg).await;

        assert!(try_recv_msg(&mut a_rx).is_none());
    }

    #[tokio::test]
    async fn full_outbox_drops_only_that_recipient() {
        let hub = Hub::new();

        // "slow" has room for exactly one frame: the connected message.
        let (slow, mut slow_rx) = test_client_with_capacity("slow", 1);
        hub.handle_register(slow).await;
        let mut healthy_rx = register_direct(&hub, "healthy").await;

        hub.join_room("slow", "42-69").await;
        hub.join_room("healthy", "42-69").await;

        let msg: SignalingMessage = serde_json::from_str(
            r#"{"type":"offer","from":"x","roomId":"42-69","payload":"P"}"#,
        )
        .unwrap();
        hub.handle_route(&msg).await;

        // The healthy member still hears the broadcast.
        loop {
            let received = recv_msg(&mut healthy_rx).await;
            if received.msg_type == MessageType::Offer {
                break;
            }
        }

        // The slow member lost it: its outbox still holds only the
        // connected frame (and the peer-joined never fit either).
        let first = try_recv_msg(&mut slow_rx).unwrap();
        assert_eq!(first.msg_type, MessageType::Connected);
        assert!(try_recv_msg(&mut slow_rx).is_none());

        // After draining, the next routed message arrives normally.
        hub.handle_route(&msg).await;
        let received = recv_msg(&mut slow_rx).await;
        assert_eq!(received.msg_type, MessageType::Offer);
    }

    #[tokio::test]
    async fn unregister_notifies_room_and_deletes_when_empty() {
        let hub = Hub::new();
        let mut a_rx = register_direct(&hub, "a").await;
        let _b_rx = register_direct(&hub, "b").await;

        hub.join_room("a", "42-69").await;
        hub.join_room("b", "42-69").await;
        let _ = recv_msg(&mut a_rx).await; // peer-joined for b

        hub.handle_unregister("b").await;
        let left = recv_msg(&mut a_rx).await;
        assert_eq!(left.msg_type, MessageType::PeerLeft);
        assert_eq!(left.client_id.as_deref(), Some("b"));
        assert_eq!(hub.snapshot().await.active_rooms, 1);

        hub.handle_unregister("a").await;
        assert_eq!(hub.snapshot().await.active_rooms, 0);
        assert_eq!(hub.snapshot().await.active_clients, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweep_notifies_and_deletes() {
        let hub = Hub::new();
        let mut a_rx = register_direct(&hub, "a").await;

        hub.join_room("a", "11-22").await;
        tokio::time::advance(ROOM_EXPIRY + Duration::from_secs(1)).await;

        hub.expire_rooms().await;

        let expired = recv_msg(&mut a_rx).await;
        assert_eq!(expired.msg_type, MessageType::RoomExpired);
        assert_eq!(expired.room_id.as_deref(), Some("11-22"));

        // The member stays connected but is no longer in any room.
        assert_eq!(hub.snapshot().await.active_rooms, 0);
        assert_eq!(hub.snapshot().await.active_clients, 1);
        assert_eq!(hub.room_of("a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn young_rooms_survive_the_sweep() {
        let hub = Hub::new();
        let _a_rx = register_direct(&hub, "a").await;

        hub.join_room("a", "11-22").await;
        tokio::time::advance(ROOM_EXPIRY - Duration::from_secs(5)).await;

        hub.expire_rooms().await;
        assert_eq!(hub.snapshot().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_every_outbox() {
        let hub = Hub::new();
        let cancel = CancellationToken::new();
        let run = {
            let hub = Arc::clone(&hub);
            let cancel = cancel.clone();
            tokio::spawn(async move { hub.run(cancel).await })
        };

        let (handle, _rx) = test_client("a");
        let client_cancel = handle.cancel.clone();
        hub.register(handle).await.unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("hub should stop")
            .expect("no panic");

        assert!(client_cancel.is_cancelled());

        // Commands after shutdown are refused or ignored.
        let (late, _late_rx) = test_client("late");
        assert!(hub.register(late).await.is_err());
        hub.unregister("a").await;
    }

    #[tokio::test]
    async fn command_loop_processes_in_order() {
        let hub = Hub::new();
        let cancel = CancellationToken::new();
        let run = {
            let hub = Arc::clone(&hub);
            let cancel = cancel.clone();
            tokio::spawn(async move { hub.run(cancel).await })
        };

        let (a, mut a_rx) = test_client("a");
        let (b, mut b_rx) = test_client("b");
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        assert_eq!(recv_msg(&mut a_rx).await.msg_type, MessageType::Connected);
        assert_eq!(recv_msg(&mut b_rx).await.msg_type, MessageType::Connected);

        hub.join_room("a", "42-69").await;
        hub.join_room("b", "42-69").await;
        let _ = recv_msg(&mut a_rx).await; // peer-joined for b

        let first: SignalingMessage =
            serde_json::from_str(r#"{"type":"offer","from":"a","roomId":"42-69","payload":1}"#)
                .unwrap();
        let second: SignalingMessage =
            serde_json::from_str(r#"{"type":"ice-candidate","from":"a","roomId":"42-69","payload":2}"#)
                .unwrap();
        hub.route(first).await;
        hub.route(second).await;

        // FIFO within b's outbox.
        assert_eq!(recv_msg(&mut b_rx).await.msg_type, MessageType::Offer);
        assert_eq!(
            recv_msg(&mut b_rx).await.msg_type,
            MessageType::IceCandidate
        );

        cancel.cancel();
        let _ = run.await;
    }
}
