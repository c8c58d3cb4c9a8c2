//! Room directory: CRUD over room records and their collaborator lists.
//!
//! DESIGN
//! ======
//! Every operation loads the room and the caller's workspace membership
//! fresh from the store and runs the resolver before touching anything.
//! Permission values supplied by callers are never consulted.
//!
//! Each mutation is a single read-modify-write of one room record; the
//! store's per-record atomicity is the only concurrency control.
//!
//! ERROR HANDLING
//! ==============
//! A room that does not exist is reported as `Unauthorized`, the same as a
//! private room the caller cannot see, so the directory never confirms that
//! an id exists to someone outside it. `NotFound` is reserved for a room
//! that disappears between the permission check and the write.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{RoomStore, StoreError};
use crate::model::{Room, WorkspaceRole};
use crate::services::permission::{CanvasPermission, resolve};

const MAX_NAME_CHARS: usize = 120;
const MAX_THUMBNAIL_LEN: usize = 2048;

/// The only collaborator role. Collaborators always have standing edit access.
pub const COLLABORATOR_ROLE: &str = "editor";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("not authorized")]
    Unauthorized,
    #[error("insufficient permission")]
    Forbidden,
    #[error("room not found: {0}")]
    NotFound(Uuid),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "E_UNAUTHORIZED",
            Self::Forbidden => "E_FORBIDDEN",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::Validation(_) => "E_VALIDATION",
            Self::Store(_) => "E_STORE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Body of `POST /rooms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRoom {
    pub name: String,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub is_public: Option<bool>,
}

/// Body of `PATCH /rooms/{roomId}`. At least one field must be present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub is_public: Option<bool>,
    /// Empty string clears the thumbnail.
    pub thumbnail_url: Option<String>,
}

impl RoomUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.is_public.is_none() && self.thumbnail_url.is_none()
    }
}

/// A room as returned by `get`, with the caller's permissions alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetail {
    #[serde(flatten)]
    pub room: Room,
    pub permissions: CanvasPermission,
}

/// Fresh room, membership and resolved permissions for one caller.
struct RoomContext {
    room: Room,
    membership: Option<WorkspaceRole>,
    permissions: CanvasPermission,
}

async fn load_context(store: &dyn RoomStore, room_id: Uuid, user_id: Uuid) -> Result<RoomContext, RoomError> {
    // An unknown id answers like a private room the caller cannot see.
    // `NotFound` is kept for rooms that vanish between read and write.
    let Some(room) = store.get_room(room_id).await? else {
        return Err(RoomError::Unauthorized);
    };
    let membership = store.membership(room.workspace_id, user_id).await?;
    let permissions = resolve(&room, user_id, membership);
    Ok(RoomContext { room, membership, permissions })
}

async fn save(store: &dyn RoomStore, room: &Room) -> Result<(), RoomError> {
    if store.update_room(room).await? {
        Ok(())
    } else {
        Err(RoomError::NotFound(room.id))
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

fn validate_name(raw: &str) -> Result<String, RoomError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(RoomError::Validation("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(RoomError::Validation(format!("name must be at most {MAX_NAME_CHARS} characters")));
    }
    Ok(name.to_owned())
}

fn validate_thumbnail(raw: &str) -> Result<Option<String>, RoomError> {
    let url = raw.trim();
    if url.is_empty() {
        return Ok(None);
    }
    if url.len() > MAX_THUMBNAIL_LEN {
        return Err(RoomError::Validation(format!("thumbnailUrl must be at most {MAX_THUMBNAIL_LEN} bytes")));
    }
    Ok(Some(url.to_owned()))
}

// =============================================================================
// READ
// =============================================================================

/// Rooms of a workspace, newest first. Caller must be a workspace member.
///
/// # Errors
///
/// `Forbidden` for non-members, `Store` on backend failure.
pub async fn list_rooms(store: &dyn RoomStore, workspace_id: Uuid, user_id: Uuid) -> Result<Vec<Room>, RoomError> {
    if store.membership(workspace_id, user_id).await?.is_none() {
        warn!(%workspace_id, %user_id, "list denied: not a workspace member");
        return Err(RoomError::Forbidden);
    }
    Ok(store.list_rooms(workspace_id).await?)
}

/// Fetch one room with the caller's permissions.
///
/// # Errors
///
/// `Unauthorized` when the caller is outside the workspace and the room is
/// private (or absent), `Forbidden` for any other denial.
pub async fn get_room(store: &dyn RoomStore, room_id: Uuid, user_id: Uuid) -> Result<RoomDetail, RoomError> {
    let ctx = load_context(store, room_id, user_id).await?;
    if !ctx.permissions.can_view {
        warn!(%room_id, %user_id, "get denied");
        if ctx.membership.is_none() && !ctx.room.is_public {
            return Err(RoomError::Unauthorized);
        }
        return Err(RoomError::Forbidden);
    }
    Ok(RoomDetail { room: ctx.room, permissions: ctx.permissions })
}

// =============================================================================
// WRITE
// =============================================================================

/// Create a room. The caller becomes owner and sole collaborator.
///
/// # Errors
///
/// `Forbidden` for non-members of the workspace, `Validation` for a bad name.
pub async fn create_room(store: &dyn RoomStore, user_id: Uuid, new: NewRoom) -> Result<Room, RoomError> {
    let name = validate_name(&new.name)?;
    if store.membership(new.workspace_id, user_id).await?.is_none() {
        warn!(workspace_id = %new.workspace_id, %user_id, "create denied: not a workspace member");
        return Err(RoomError::Forbidden);
    }

    let now = OffsetDateTime::now_utc();
    let room = Room {
        id: Uuid::new_v4(),
        name,
        workspace_id: new.workspace_id,
        created_by: user_id,
        collaborators: vec![user_id],
        is_public: new.is_public.unwrap_or(false),
        thumbnail_url: None,
        created_at: now,
        last_modified: now,
    };
    store.insert_room(&room).await?;

    info!(room_id = %room.id, workspace_id = %room.workspace_id, %user_id, "room created");
    Ok(room)
}

/// Rename, toggle visibility or set the thumbnail. Requires `canEdit`.
///
/// # Errors
///
/// `Unauthorized` without `canEdit`, `Validation` for an empty or bad patch.
pub async fn update_room(
    store: &dyn RoomStore,
    room_id: Uuid,
    user_id: Uuid,
    update: RoomUpdate,
) -> Result<Room, RoomError> {
    let ctx = load_context(store, room_id, user_id).await?;
    if !ctx.permissions.can_edit {
        warn!(%room_id, %user_id, "update denied");
        return Err(RoomError::Unauthorized);
    }
    if update.is_empty() {
        return Err(RoomError::Validation("no fields to update".into()));
    }

    let mut room = ctx.room;
    if let Some(name) = update.name.as_deref() {
        room.name = validate_name(name)?;
    }
    if let Some(url) = update.thumbnail_url.as_deref() {
        room.thumbnail_url = validate_thumbnail(url)?;
    }
    if let Some(is_public) = update.is_public {
        room.is_public = is_public;
    }
    room.touch();
    save(store, &room).await?;

    info!(%room_id, %user_id, "room updated");
    Ok(room)
}

/// Delete a room. Requires `canDelete`. Returns the deleted id.
///
/// # Errors
///
/// `Unauthorized` without `canDelete`.
pub async fn delete_room(store: &dyn RoomStore, room_id: Uuid, user_id: Uuid) -> Result<Uuid, RoomError> {
    let ctx = load_context(store, room_id, user_id).await?;
    if !ctx.permissions.can_delete {
        warn!(%room_id, %user_id, "delete denied");
        return Err(RoomError::Unauthorized);
    }
    if !store.delete_room(room_id).await? {
        return Err(RoomError::NotFound(room_id));
    }

    info!(%room_id, %user_id, "room deleted");
    Ok(room_id)
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Add a workspace member as collaborator. Requires `canInvite`.
///
/// # Errors
///
/// `Forbidden` without `canInvite`; `Validation` when the target is outside
/// the workspace, already a collaborator, or the role is not `editor`.
pub async fn add_collaborator(
    store: &dyn RoomStore,
    room_id: Uuid,
    user_id: Uuid,
    target: Uuid,
    role: Option<&str>,
) -> Result<Room, RoomError> {
    let ctx = load_context(store, room_id, user_id).await?;
    if !ctx.permissions.can_invite {
        warn!(%room_id, %user_id, "invite denied");
        return Err(RoomError::Forbidden);
    }
    if let Some(role) = role
        && role != COLLABORATOR_ROLE
    {
        return Err(RoomError::Validation(format!("unsupported role: {role}")));
    }

    let mut room = ctx.room;
    if room.is_collaborator(target) {
        return Err(RoomError::Validation("user is already a collaborator".into()));
    }
    if store.membership(room.workspace_id, target).await?.is_none() {
        return Err(RoomError::Validation("user is not a member of this workspace".into()));
    }

    room.collaborators.push(target);
    room.touch();
    save(store, &room).await?;

    info!(%room_id, %user_id, %target, "collaborator added");
    Ok(room)
}

/// Remove a collaborator. Allowed for the owner, a workspace admin, or the
/// collaborator removing themself. The owner can never be removed.
///
/// # Errors
///
/// `Unauthorized` when none of the above applies; `Validation` when the
/// target is the owner or not a collaborator.
pub async fn remove_collaborator(
    store: &dyn RoomStore,
    room_id: Uuid,
    user_id: Uuid,
    target: Uuid,
) -> Result<Room, RoomError> {
    let ctx = load_context(store, room_id, user_id).await?;
    let is_owner = ctx.room.created_by == user_id;
    let is_workspace_admin = ctx.membership == Some(WorkspaceRole::Admin);
    let is_self = target == user_id && ctx.permissions.can_view;
    if !(is_owner || is_workspace_admin || is_self) {
        warn!(%room_id, %user_id, %target, "collaborator removal denied");
        return Err(RoomError::Unauthorized);
    }

    let mut room = ctx.room;
    if target == room.created_by {
        return Err(RoomError::Validation("the room owner cannot be removed".into()));
    }
    if !room.is_collaborator(target) {
        return Err(RoomError::Validation("user is not a collaborator".into()));
    }

    room.collaborators.retain(|id| *id != target);
    room.touch();
    save(store, &room).await?;

    info!(%room_id, %user_id, %target, "collaborator removed");
    Ok(room)
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
