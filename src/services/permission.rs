//! Permission resolver: who may view, edit, delete, or invite in a room.
//!
//! DESIGN
//! ======
//! [`resolve`] is a pure function over a room record and the requester's
//! workspace membership. The four flags are computed independently from
//! four pieces of evidence (owner, workspace admin, collaborator, workspace
//! member); none short-circuits another.
//!
//! [`permissions_for`] is the store-backed entry point. It is total: any
//! lookup failure or a missing room yields [`CanvasPermission::none`].
//! Results are never cached; callers re-resolve on every request because
//! collaborators and visibility can change between checks.

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::db::RoomStore;
use crate::model::{Room, WorkspaceRole};

// =============================================================================
// TYPES
// =============================================================================

/// Derived, non-persisted access flags for one user in one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasPermission {
    pub can_view: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_invite: bool,
}

impl CanvasPermission {
    /// Default-deny value.
    #[must_use]
    pub const fn none() -> Self {
        Self { can_view: false, can_edit: false, can_delete: false, can_invite: false }
    }

    #[must_use]
    pub fn allows(self, permission: Permission) -> bool {
        match permission {
            Permission::View => self.can_view,
            Permission::Edit => self.can_edit,
            Permission::Delete => self.can_delete,
            Permission::Invite => self.can_invite,
        }
    }

    /// Required permissions this value does not grant, in request order.
    #[must_use]
    pub fn missing(self, required: &[Permission]) -> Vec<Permission> {
        required.iter().copied().filter(|p| !self.allows(*p)).collect()
    }
}

/// One named permission, spelled as its wire flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "canView")]
    View,
    #[serde(rename = "canEdit")]
    Edit,
    #[serde(rename = "canDelete")]
    Delete,
    #[serde(rename = "canInvite")]
    Invite,
}

impl Permission {
    pub const ALL: [Permission; 4] = [Self::View, Self::Edit, Self::Delete, Self::Invite];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "canView",
            Self::Edit => "canEdit",
            Self::Delete => "canDelete",
            Self::Invite => "canInvite",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == raw)
    }
}

/// Result of checking one or more named permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionCheck {
    pub has_permission: bool,
    pub permissions: CanvasPermission,
    /// Present only for multi-permission checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<Permission>>,
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Compute permissions for `user_id` in `room`.
#[must_use]
pub fn resolve(room: &Room, user_id: Uuid, membership: Option<WorkspaceRole>) -> CanvasPermission {
    let is_owner = room.created_by == user_id;
    let is_workspace_admin = membership == Some(WorkspaceRole::Admin);
    let is_collaborator = room.is_collaborator(user_id);
    let is_workspace_member = membership.is_some();

    CanvasPermission {
        can_view: is_workspace_member || is_collaborator || room.is_public,
        can_edit: is_owner || is_workspace_admin || is_collaborator,
        can_delete: is_owner || is_workspace_admin,
        can_invite: is_owner || is_workspace_admin,
    }
}

/// Load fresh room and membership state and resolve. Never fails.
pub async fn permissions_for(store: &dyn RoomStore, room_id: Uuid, user_id: Uuid) -> CanvasPermission {
    let room = match store.get_room(room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => return CanvasPermission::none(),
        Err(e) => {
            warn!(%room_id, %user_id, error = %e, "room lookup failed; denying");
            return CanvasPermission::none();
        }
    };

    match store.membership(room.workspace_id, user_id).await {
        Ok(membership) => resolve(&room, user_id, membership),
        Err(e) => {
            warn!(%room_id, %user_id, error = %e, "membership lookup failed; denying");
            CanvasPermission::none()
        }
    }
}

/// Check a single permission.
pub async fn check_permission(
    store: &dyn RoomStore,
    room_id: Uuid,
    user_id: Uuid,
    permission: Permission,
) -> PermissionCheck {
    let permissions = permissions_for(store, room_id, user_id).await;
    PermissionCheck { has_permission: permissions.allows(permission), permissions, missing: None }
}

/// Check several permissions and report which ones are missing.
pub async fn check_permissions(
    store: &dyn RoomStore,
    room_id: Uuid,
    user_id: Uuid,
    required: &[Permission],
) -> PermissionCheck {
    let permissions = permissions_for(store, room_id, user_id).await;
    let missing = permissions.missing(required);
    PermissionCheck { has_permission: missing.is_empty(), permissions, missing: Some(missing) }
}

#[cfg(test)]
#[path = "permission_test.rs"]
mod tests;
