//! Wire protocol for the persistent sync connection.
//!
//! All traffic on the WebSocket is a bincode-encoded [`WireMessage`]. Rooms
//! are scoped to a single board or a single document; there is no global
//! ordering across rooms, only server-assigned order within one.
//!
//! ```text
//! ┌──────────┐   WireMessage (bincode)   ┌──────────┐
//! │  Client  │ ◄───────────────────────► │  Server  │
//! └──────────┘                           └──────────┘
//!   Hello / JoinBoard / DocumentJoin …  client → server
//!   RoomMembers / DocumentSync          server → client
//!   DocumentUpdate / Event / typing     bidirectional
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::unix_millis;
use crate::events::DomainEvent;

/// Envelope schema version, carried in every event's metadata.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifier of a room: one board or one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomId {
    Board(Uuid),
    Document(Uuid),
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Board(id) => write!(f, "board:{id}"),
            RoomId::Document(id) => write!(f, "document:{id}"),
        }
    }
}

/// Presence entry for a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    /// Milliseconds since epoch when the member joined the room.
    pub joined_at: u64,
    /// Milliseconds since epoch of the member's last observed activity.
    pub last_activity: u64,
}

impl MemberProfile {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        let now = unix_millis();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            avatar: None,
            joined_at: now,
            last_activity: now,
        }
    }

    /// Create with an explicit id (for testing).
    pub fn with_id(id: Uuid, name: impl Into<String>, email: impl Into<String>) -> Self {
        let now = unix_millis();
        Self {
            id,
            name: name.into(),
            email: email.into(),
            avatar: None,
            joined_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = unix_millis();
    }
}

/// Display identity attached to awareness broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBadge {
    pub name: String,
    /// Hex color, stable per user id.
    pub color: String,
}

impl UserBadge {
    /// Derive a stable color from the user id hash.
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        let hash = user_id.as_u128();
        Self {
            name: name.into(),
            color: format!("#{:06x}", (hash & 0xFF_FF_FF) as u32),
        }
    }
}

/// Ephemeral cursor/selection state for one client in one document.
///
/// Not persisted, not part of the replicated log; last write per user wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// Caret position as a character offset, if the user has focus.
    pub cursor: Option<u32>,
    /// Selected range `(start, end)` in character offsets.
    pub selection: Option<(u32, u32)>,
    pub user: UserBadge,
}

impl AwarenessState {
    pub fn idle(user: UserBadge) -> Self {
        Self {
            cursor: None,
            selection: None,
            user,
        }
    }
}

/// Every message exchanged over the persistent connection.
///
/// Closed enum: adding a variant is a protocol version bump. Event payloads
/// for unknown *domain* event types go through
/// [`EventKind::Unknown`](crate::events::EventKind) instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message after connect: authenticate the session.
    Hello { token: String, user_id: Uuid },

    /// Join/leave a kanban board room.
    JoinBoard { board_id: Uuid },
    LeaveBoard { board_id: Uuid },

    /// Join/leave a document room.
    DocumentJoin { document_id: Uuid, workspace_id: Uuid },
    DocumentLeave { document_id: Uuid },

    /// One-shot initial snapshot of the replicated state. Server → client only.
    DocumentSync { document_id: Uuid, update: Vec<u8> },
    /// Incremental replicated-state update. Bidirectional.
    DocumentUpdate { document_id: Uuid, update: Vec<u8> },
    /// Ephemeral cursor/selection broadcast.
    DocumentAwareness {
        document_id: Uuid,
        user_id: Uuid,
        state: AwarenessState,
    },
    DocumentUserJoined {
        document_id: Uuid,
        member: MemberProfile,
    },
    DocumentUserLeft { document_id: Uuid, user_id: Uuid },

    /// Full member list, sent by the server as the room-join acknowledgment.
    RoomMembers {
        room: RoomId,
        members: Vec<MemberProfile>,
    },
    MemberJoined { room: RoomId, member: MemberProfile },
    MemberLeft { room: RoomId, user_id: Uuid },

    /// Typing indicator, outbound (`card_id` only — the server stamps the user).
    TypingStart { card_id: Uuid },
    TypingStop { card_id: Uuid },
    /// Typing indicator, inbound.
    TypingStarted {
        card_id: Uuid,
        user_id: Uuid,
        user_name: Option<String>,
    },
    TypingStopped { card_id: Uuid, user_id: Uuid },

    /// Generic domain-event envelope (board/card/list/comment/… changes).
    Event(DomainEvent),

    Ping,
    Pong,
}

impl WireMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// The room this message is scoped to, if any.
    pub fn room(&self) -> Option<RoomId> {
        match self {
            WireMessage::JoinBoard { board_id } | WireMessage::LeaveBoard { board_id } => {
                Some(RoomId::Board(*board_id))
            }
            WireMessage::DocumentJoin { document_id, .. }
            | WireMessage::DocumentLeave { document_id }
            | WireMessage::DocumentSync { document_id, .. }
            | WireMessage::DocumentUpdate { document_id, .. }
            | WireMessage::DocumentAwareness { document_id, .. }
            | WireMessage::DocumentUserJoined { document_id, .. }
            | WireMessage::DocumentUserLeft { document_id, .. } => {
                Some(RoomId::Document(*document_id))
            }
            WireMessage::RoomMembers { room, .. }
            | WireMessage::MemberJoined { room, .. }
            | WireMessage::MemberLeft { room, .. } => Some(*room),
            _ => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
