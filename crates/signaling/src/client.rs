//! Client session: socket pumps, bounded outbox, heartbeats.
//!
//! Each connection runs a read task and a write task joined by a bounded
//! outbox channel. The write task is the only writer to the socket,
//! heartbeat frames included. Cancelling the connection token closes the
//! outbox, which makes the write task flush a close frame and exit.

use std::sync::Arc;

use axum::extract::ws::Message as WsMessage;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use warplan_protocol::constants::{WS_PING_PERIOD, WS_PONG_WAIT, WS_WRITE_WAIT};
use warplan_protocol::{MessageType, SignalingMessage};

use crate::hub::{ClientHandle, Hub};
use crate::OUTBOX_CAPACITY;

/// Handle for enqueueing outbound frames to one client.
///
/// Cloneable and cheap; wraps the bounded outbox sender. Enqueueing
/// never blocks; a full or closed outbox is reported as [`SendError`].
#[derive(Clone)]
pub(crate) struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

/// Error returned when the outbox is full or the connection is closing.
#[derive(Debug, thiserror::Error)]
#[error("send failed: outbox full or closed")]
pub(crate) struct SendError;

impl Sender {
    pub(crate) fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    /// Serializes and enqueues a message without blocking.
    pub(crate) fn send_msg(&self, msg: &SignalingMessage) -> Result<(), SendError> {
        let json = serde_json::to_string(msg).map_err(|_| SendError)?;
        self.tx
            .try_send(WsMessage::Text(json.into()))
            .map_err(|_| SendError)
    }
}

/// Runs one client session to completion.
///
/// Registers with the hub first, so the `connected` frame is in the
/// outbox before anything else can be enqueued, then drives the read
/// loop inline while the write pump drains the outbox. Whichever side
/// fails first cancels the shared token; unregistration is signaled
/// exactly once, on the read path's way out.
pub async fn run_session<S>(socket: S, id: String, hub: Arc<Hub>, server_cancel: &CancellationToken)
where
    S: Stream<Item = Result<WsMessage, axum::Error>>
        + Sink<WsMessage, Error = axum::Error>
        + Send
        + 'static,
{
    let (tx, outbox) = mpsc::channel(OUTBOX_CAPACITY);
    let cancel = server_cancel.child_token();
    let sender = Sender::new(tx);

    let handle = ClientHandle {
        id: id.clone(),
        room_id: None,
        sender: sender.clone(),
        cancel: cancel.clone(),
    };
    if hub.register(handle).await.is_err() {
        debug!(client_id = %id, "hub unavailable, dropping connection");
        return;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbox, cancel.clone(), id.clone()));

    read_pump(stream, &id, &sender, &hub, cancel.clone()).await;

    cancel.cancel();
    hub.unregister(&id).await;
    let _ = writer.await;
    debug!(client_id = %id, "session ended");
}

/// Read pump: decodes inbound frames and dispatches them to the hub.
///
/// The read deadline is refreshed only by heartbeat acks; a peer that
/// keeps sending without ever answering pings is still considered dead.
async fn read_pump<S>(
    mut stream: S,
    id: &str,
    sender: &Sender,
    hub: &Arc<Hub>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let deadline = sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!(client_id = %id, "read deadline elapsed, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(id, text.as_str(), sender, hub).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        trace!(client_id = %id, "heartbeat ack");
                        deadline.as_mut().reset(Instant::now() + WS_PONG_WAIT);
                    }
                    // Pong replies to peer pings are the transport's job.
                    Some(Ok(WsMessage::Ping(_))) => {}
                    Some(Ok(WsMessage::Binary(_))) => {
                        trace!(client_id = %id, "ignoring binary frame");
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(client_id = %id, "received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client_id = %id, "read error: {e}");
                        break;
                    }
                    None => {
                        debug!(client_id = %id, "stream ended");
                        break;
                    }
                }
            }
        }
    }
}

/// Decodes one text frame and dispatches by message type.
///
/// Malformed frames get an in-band `error` reply; the connection stays
/// up. The `from` field is always overwritten with the server-assigned
/// id, the only sender identity a recipient can trust.
async fn handle_frame(id: &str, text: &str, sender: &Sender, hub: &Arc<Hub>) {
    let mut msg: SignalingMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(client_id = %id, "invalid frame: {e}");
            let _ = sender.send_msg(&SignalingMessage::error("Invalid message format"));
            return;
        }
    };

    msg.from = Some(id.to_string());

    // Empty strings on the wire mean "unset".
    if msg.to.as_deref() == Some("") {
        msg.to = None;
    }
    if msg.room_id.as_deref() == Some("") {
        msg.room_id = None;
    }

    match msg.msg_type {
        MessageType::HandshakeInit => {
            let Some(room_id) = msg.room_id else {
                let _ = sender.send_msg(&SignalingMessage::error("Room ID required for handshake"));
                return;
            };
            hub.join_room(id, &room_id).await;
        }
        t if t.is_relay() => {
            if msg.to.is_none() && msg.room_id.is_none() {
                msg.room_id = hub.room_of(id).await;
            }
            hub.route(msg).await;
        }
        _ => {
            let _ = sender.send_msg(&SignalingMessage::error("Unknown message type"));
        }
    }
}

/// Write pump: sole writer to the socket. Drains the outbox, interleaves
/// heartbeat pings, and enforces the per-frame write deadline.
async fn write_pump<S>(
    mut sink: S,
    mut outbox: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
    id: String,
) where
    S: Sink<WsMessage, Error = axum::Error> + Unpin,
{
    let mut heartbeat = interval(WS_PING_PERIOD);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // Skip the immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = outbox.recv() => {
                let Some(msg) = msg else { break };
                match timeout(WS_WRITE_WAIT, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(client_id = %id, "write error: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!(client_id = %id, "write deadline elapsed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                match timeout(WS_WRITE_WAIT, sink.send(WsMessage::Ping(vec![].into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(client_id = %id, "heartbeat write error: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!(client_id = %id, "heartbeat deadline elapsed");
                        break;
                    }
                }
            }
        }
    }

    // Best-effort close frame, then unblock the read half.
    let _ = timeout(WS_WRITE_WAIT, sink.send(WsMessage::Close(None))).await;
    cancel.cancel();
}
