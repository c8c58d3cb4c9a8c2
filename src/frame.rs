//! Frame: the envelope for every realtime channel message.
//!
//! ARCHITECTURE
//! ============
//! Clients and the server exchange JSON frames over one websocket per room.
//! The envelope carries correlation (`id`/`parentId`), scoping (`roomId`),
//! origin (`from`, a connection id) and a lifecycle `status`. The payload is
//! a closed tagged union validated by serde at the channel boundary, so
//! handlers match on variants instead of probing loose maps.
//!
//! DESIGN
//! ======
//! - Every exchange is `request → done` or `request → error`.
//! - Peer notifications are plain `request` frames with `from` set and no
//!   `parentId`.
//! - Replies inherit `roomId` from the request.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{BroadcastEvent, PeerPresence, Presence, Shape};
use crate::services::permission::CanvasPermission;

// =============================================================================
// TYPES
// =============================================================================

/// Lifecycle position of a frame in a request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Done,
    Error,
}

impl Status {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }
}

/// Full room state sent in reply to `join`. Also the resync payload after a
/// reconnect: clients replace their whole map with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub shapes: Vec<Shape>,
    pub peers: Vec<PeerPresence>,
    pub permissions: CanvasPermission,
}

/// Channel payloads. Serialized as `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Message {
    Connected { connection_id: Uuid, user_id: Uuid },
    Join,
    Leave,
    Snapshot(Snapshot),
    PresenceUpdate(Presence),
    PresenceLeave,
    StoragePut { key: String, shape: Shape },
    StorageDelete { key: String },
    /// Authoritative value a client must restore after a denied write.
    /// `shape: None` means the key must not exist.
    StorageReject { key: String, shape: Option<Shape> },
    BroadcastEvent(BroadcastEvent),
    RoomDeleted,
    Ack,
    Error { code: String, message: String, retryable: bool },
}

impl Message {
    /// Stable name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Snapshot(_) => "snapshot",
            Self::PresenceUpdate(_) => "presence-update",
            Self::PresenceLeave => "presence-leave",
            Self::StoragePut { .. } => "storage-put",
            Self::StorageDelete { .. } => "storage-delete",
            Self::StorageReject { .. } => "storage-reject",
            Self::BroadcastEvent(_) => "broadcast-event",
            Self::RoomDeleted => "room-deleted",
            Self::Ack => "ack",
            Self::Error { .. } => "error",
        }
    }

    /// Presence traffic is high-frequency and excluded from logging.
    #[must_use]
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::PresenceUpdate(_) | Self::PresenceLeave)
    }
}

/// The channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Uuid>,
    pub status: Status,
    pub body: Message,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame.
    #[must_use]
    pub fn request(body: Message) -> Self {
        Self { id: Uuid::new_v4(), parent_id: None, ts: now_ms(), room_id: None, from: None, status: Status::Request, body }
    }

    /// Create a done reply with an `ack` payload.
    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Message::Ack)
    }

    /// Create a done reply carrying a payload.
    #[must_use]
    pub fn done_with(&self, body: Message) -> Self {
        self.reply(Status::Done, body)
    }

    /// Create an error reply from a plain message.
    #[must_use]
    pub fn error(&self, code: &str, message: impl Into<String>) -> Self {
        self.reply(Status::Error, Message::Error { code: code.to_owned(), message: message.into(), retryable: false })
    }

    /// Create a structured error reply from a typed error.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        self.reply(
            Status::Error,
            Message::Error { code: err.error_code().to_owned(), message: err.to_string(), retryable: err.retryable() },
        )
    }

    /// Build a reply frame. Inherits `room_id` and correlates via `parent_id`.
    fn reply(&self, status: Status, body: Message) -> Self {
        Self { id: Uuid::new_v4(), parent_id: Some(self.id), ts: now_ms(), room_id: self.room_id, from: None, status, body }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_room_id(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: Uuid) -> Self {
        self.from = Some(from);
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================
