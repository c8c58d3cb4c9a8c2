//! Shape service: last-writer-wins writes to a room's shared object store.
//!
//! DESIGN
//! ======
//! The canonical map lives in `RoomState::shapes`. A put replaces exactly
//! one key wholesale; a delete removes exactly one key. There is no field
//! merge and no version check: the write that takes the room lock last is
//! the value everyone converges to.
//!
//! Accepted writes are published to every joined connection, the writer
//! included, while the room lock is still held. Each connection's queue
//! therefore sees storage writes in acceptance order, and a client that
//! applies them in arrival order ends on the canonical value.
//!
//! Every write re-resolves the caller's permissions from the store first.
//! A collaborator removed a moment ago is refused on their next write even
//! though their connection is still open.

use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Frame, Message};
use crate::model::Shape;
use crate::services::channel::publish;
use crate::services::permission::permissions_for;
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("room not loaded: {0}")]
    RoomNotLoaded(Uuid),
    #[error("edit permission required")]
    Forbidden,
    #[error("invalid shape: {0}")]
    Validation(String),
}

impl crate::frame::ErrorCode for ShapeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotLoaded(_) => "E_ROOM_NOT_LOADED",
            Self::Forbidden => "E_FORBIDDEN",
            Self::Validation(_) => "E_VALIDATION",
        }
    }
}

async fn require_edit(state: &AppState, room_id: Uuid, user_id: Uuid) -> Result<(), ShapeError> {
    if permissions_for(state.store.as_ref(), room_id, user_id).await.can_edit {
        Ok(())
    } else {
        warn!(%room_id, %user_id, "storage write denied");
        Err(ShapeError::Forbidden)
    }
}

// =============================================================================
// WRITES
// =============================================================================

/// Replace the shape stored under `key` and publish it to the room.
/// `origin` is the writing connection, stamped as `from`.
///
/// # Errors
///
/// `Validation` when `key` differs from `shape.id` or the shape is malformed,
/// `Forbidden` without `canEdit`, `RoomNotLoaded` if nobody joined the room.
pub async fn put_shape(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    origin: Uuid,
    key: &str,
    shape: Shape,
) -> Result<Shape, ShapeError> {
    if shape.id != key {
        return Err(ShapeError::Validation(format!("key {key} does not match shape id {}", shape.id)));
    }
    shape.validate().map_err(ShapeError::Validation)?;
    require_edit(state, room_id, user_id).await?;

    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&room_id).ok_or(ShapeError::RoomNotLoaded(room_id))?;

    room.seq += 1;
    room.deleted.remove(key);
    room.dirty.insert(key.to_owned(), room.seq);
    room.shapes.insert(key.to_owned(), shape.clone());

    let published = Frame::request(Message::StoragePut { key: key.to_owned(), shape: shape.clone() })
        .with_room_id(room_id)
        .with_from(origin);
    publish(room, room_id, &published);

    info!(%room_id, %user_id, %key, "shape put");
    Ok(shape)
}

/// Remove the shape stored under `key` and publish the removal. Returns
/// whether it existed. Deleting an absent key changes nothing but is still
/// published, so every accepted write reaches its writer exactly once.
///
/// # Errors
///
/// `Forbidden` without `canEdit`, `RoomNotLoaded` if nobody joined the room.
pub async fn delete_shape(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    origin: Uuid,
    key: &str,
) -> Result<bool, ShapeError> {
    require_edit(state, room_id, user_id).await?;

    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&room_id).ok_or(ShapeError::RoomNotLoaded(room_id))?;

    let existed = room.shapes.remove(key).is_some();
    if existed {
        room.seq += 1;
        room.dirty.remove(key);
        room.deleted.insert(key.to_owned(), room.seq);
        info!(%room_id, %user_id, %key, "shape deleted");
    }

    let published = Frame::request(Message::StorageDelete { key: key.to_owned() })
        .with_room_id(room_id)
        .with_from(origin);
    publish(room, room_id, &published);

    Ok(existed)
}

/// Current canonical value of `key`, used to revert a rejected write.
pub async fn current_shape(state: &AppState, room_id: Uuid, key: &str) -> Option<Shape> {
    let rooms = state.rooms.read().await;
    rooms.get(&room_id).and_then(|room| room.shapes.get(key).cloned())
}
