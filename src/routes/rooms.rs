//! Room directory routes.
//!
//! Handlers translate HTTP to `services::room` calls and map the typed
//! errors to status codes. Permission checks live in the service so the
//! websocket path and HTTP path enforce the same rules.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Room;
use crate::routes::auth::AuthUser;
use crate::services::channel;
use crate::services::permission::{self, Permission};
use crate::services::room::{self, NewRoom, RoomDetail, RoomError, RoomUpdate};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRoomsQuery {
    pub workspace_id: Uuid,
}

#[derive(Deserialize)]
pub struct PermissionsQuery {
    /// Comma-separated permission names, e.g. `canEdit,canDelete`.
    pub require: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCollaboratorBody {
    pub user_id: Uuid,
    pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedRoom {
    pub id: Uuid,
}

/// `GET /rooms?workspaceId=`: rooms of a workspace, newest first.
pub async fn list_rooms(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListRoomsQuery>,
) -> Result<Json<Vec<Room>>, StatusCode> {
    let rooms = room::list_rooms(state.store.as_ref(), query.workspace_id, auth.user_id)
        .await
        .map_err(room_error_to_status)?;
    Ok(Json(rooms))
}

/// `POST /rooms`: create a room owned by the caller.
pub async fn create_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<NewRoom>,
) -> Result<(StatusCode, Json<Room>), StatusCode> {
    let room = room::create_room(state.store.as_ref(), auth.user_id, body)
        .await
        .map_err(room_error_to_status)?;
    Ok((StatusCode::CREATED, Json(room)))
}

/// `GET /rooms/{room_id}`: room record with the caller's permissions.
pub async fn get_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
) -> Result<Json<RoomDetail>, StatusCode> {
    let detail = room::get_room(state.store.as_ref(), room_id, auth.user_id)
        .await
        .map_err(room_error_to_status)?;
    Ok(Json(detail))
}

/// `PATCH /rooms/{room_id}`: rename, toggle visibility, set thumbnail.
pub async fn update_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
    Json(body): Json<RoomUpdate>,
) -> Result<Json<Room>, StatusCode> {
    let room = room::update_room(state.store.as_ref(), room_id, auth.user_id, body)
        .await
        .map_err(room_error_to_status)?;
    Ok(Json(room))
}

/// `DELETE /rooms/{room_id}`: delete the room and disconnect its channel.
pub async fn delete_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
) -> Result<Json<DeletedRoom>, StatusCode> {
    let id = room::delete_room(state.store.as_ref(), room_id, auth.user_id)
        .await
        .map_err(room_error_to_status)?;
    channel::close_room(&state, id).await;
    Ok(Json(DeletedRoom { id }))
}

/// `GET /rooms/{room_id}/permissions[?require=a,b]`: the caller's flags,
/// or a has/missing check when `require` is given.
pub async fn get_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
    Query(query): Query<PermissionsQuery>,
) -> Result<Response, StatusCode> {
    let store = state.store.as_ref();
    let Some(raw) = query.require else {
        let permissions = permission::permissions_for(store, room_id, auth.user_id).await;
        return Ok(Json(permissions).into_response());
    };

    let required = parse_required(&raw).ok_or(StatusCode::BAD_REQUEST)?;
    let check = match required.as_slice() {
        [single] => permission::check_permission(store, room_id, auth.user_id, *single).await,
        many => permission::check_permissions(store, room_id, auth.user_id, many).await,
    };
    Ok(Json(check).into_response())
}

/// `POST /rooms/{room_id}/collaborators`: invite a workspace member.
pub async fn add_collaborator(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
    Json(body): Json<AddCollaboratorBody>,
) -> Result<Json<Room>, StatusCode> {
    let room = room::add_collaborator(state.store.as_ref(), room_id, auth.user_id, body.user_id, body.role.as_deref())
        .await
        .map_err(room_error_to_status)?;
    Ok(Json(room))
}

/// `DELETE /rooms/{room_id}/collaborators/{user_id}`: remove a collaborator.
pub async fn remove_collaborator(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_id, target)): Path<(Uuid, Uuid)>,
) -> Result<Json<Room>, StatusCode> {
    let room = room::remove_collaborator(state.store.as_ref(), room_id, auth.user_id, target)
        .await
        .map_err(room_error_to_status)?;
    Ok(Json(room))
}

/// Parse `canEdit,canDelete`. `None` for an unknown name or an empty list.
fn parse_required(raw: &str) -> Option<Vec<Permission>> {
    let required = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Permission::from_str)
        .collect::<Option<Vec<_>>>()?;
    if required.is_empty() { None } else { Some(required) }
}

pub(crate) fn room_error_to_status(err: RoomError) -> StatusCode {
    match err {
        RoomError::Unauthorized => StatusCode::UNAUTHORIZED,
        RoomError::Forbidden => StatusCode::FORBIDDEN,
        RoomError::NotFound(_) => StatusCode::NOT_FOUND,
        RoomError::Validation(_) => StatusCode::BAD_REQUEST,
        RoomError::Store(e) => {
            tracing::error!(error = %e, "room store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
