use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Discriminant of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    // Relayed peer-to-peer through the hub, payload untouched.
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    #[serde(rename = "handshake-verify")]
    HandshakeVerify,

    // Sent by a peer to the hub.
    #[serde(rename = "handshake-init")]
    HandshakeInit,

    // Originated by the hub.
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "peer-joined")]
    PeerJoined,
    #[serde(rename = "peer-left")]
    PeerLeft,
    #[serde(rename = "room-expired")]
    RoomExpired,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unrecognized type strings deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Relay types are forwarded between peers without inspection.
    pub fn is_relay(self) -> bool {
        matches!(
            self,
            Self::Offer | Self::Answer | Self::IceCandidate | Self::HandshakeVerify
        )
    }
}

/// Envelope for all signaling traffic.
///
/// `payload` uses [`RawValue`] so relayed bytes reach the addressee
/// exactly as the sender produced them. `from` is written by the hub on
/// every inbound frame; whatever the peer put there is discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl SignalingMessage {
    fn notification(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            from: None,
            to: None,
            room_id: None,
            payload: None,
            client_id: None,
        }
    }

    /// First frame on every connection: delivers the server-assigned id.
    pub fn connected(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Self::notification(MessageType::Connected)
        }
    }

    /// Tells existing room members that `client_id` has joined.
    ///
    /// `clientId` is the authoritative field; `from` carries the same id
    /// as a convenience duplicate.
    pub fn peer_joined(client_id: &str, room_id: &str) -> Self {
        Self {
            from: Some(client_id.to_string()),
            room_id: Some(room_id.to_string()),
            client_id: Some(client_id.to_string()),
            ..Self::notification(MessageType::PeerJoined)
        }
    }

    /// Tells remaining room members that `client_id` has left.
    pub fn peer_left(client_id: &str, room_id: &str) -> Self {
        Self {
            from: Some(client_id.to_string()),
            room_id: Some(room_id.to_string()),
            client_id: Some(client_id.to_string()),
            ..Self::notification(MessageType::PeerLeft)
        }
    }

    /// Tells members their room exceeded its lifetime.
    pub fn room_expired(room_id: &str) -> Self {
        Self {
            room_id: Some(room_id.to_string()),
            ..Self::notification(MessageType::RoomExpired)
        }
    }

    /// Reports a protocol violation back to the offending peer.
    ///
    /// The reason travels as a JSON string in `payload`.
    pub fn error(reason: &str) -> Self {
        let payload = serde_json::to_string(reason)
            .ok()
            .and_then(|json| RawValue::from_string(json).ok());
        Self {
            payload,
            ..Self::notification(MessageType::Error)
        }
    }
}
