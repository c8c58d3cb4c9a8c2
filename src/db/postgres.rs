//! Postgres-backed [`RoomStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{RoomStore, StoreError};
use crate::model::{Room, Shape, WorkspaceRole};

type RoomRow = (Uuid, String, Uuid, Uuid, Vec<Uuid>, bool, Option<String>, OffsetDateTime, OffsetDateTime);

const ROOM_COLUMNS: &str =
    "id, name, workspace_id, created_by, collaborators, is_public, thumbnail_url, created_at, last_modified";

fn room_from_row(row: RoomRow) -> Room {
    let (id, name, workspace_id, created_by, collaborators, is_public, thumbnail_url, created_at, last_modified) = row;
    Room { id, name, workspace_id, created_by, collaborators, is_public, thumbnail_url, created_at, last_modified }
}

#[derive(Clone)]
pub struct PgRoomStore {
    pool: PgPool,
}

impl PgRoomStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomStore for PgRoomStore {
    async fn user_for_session(&self, token: &str) -> Result<Option<Uuid>, StoreError> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM sessions WHERE token = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<WorkspaceRole>, StoreError> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM workspace_members WHERE workspace_id = $1 AND user_id = $2",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        // Unknown role strings are treated as no membership.
        Ok(role.as_deref().and_then(WorkspaceRole::from_str))
    }

    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query_as::<_, RoomRow>(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"))
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(room_from_row))
    }

    async fn list_rooms(&self, workspace_id: Uuid) -> Result<Vec<Room>, StoreError> {
        let rows = sqlx::query_as::<_, RoomRow>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE workspace_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(room_from_row).collect())
    }

    async fn insert_room(&self, room: &Room) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rooms (id, name, workspace_id, created_by, collaborators, is_public, thumbnail_url, created_at, last_modified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(room.id)
        .bind(&room.name)
        .bind(room.workspace_id)
        .bind(room.created_by)
        .bind(&room.collaborators)
        .bind(room.is_public)
        .bind(room.thumbnail_url.as_deref())
        .bind(room.created_at)
        .bind(room.last_modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_room(&self, room: &Room) -> Result<bool, StoreError> {
        // `created_by` and `workspace_id` are never rewritten.
        let result = sqlx::query(
            "UPDATE rooms SET name = $2, collaborators = $3, is_public = $4, thumbnail_url = $5, last_modified = $6 \
             WHERE id = $1",
        )
        .bind(room.id)
        .bind(&room.name)
        .bind(&room.collaborators)
        .bind(room.is_public)
        .bind(room.thumbnail_url.as_deref())
        .bind(room.last_modified)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_room(&self, room_id: Uuid) -> Result<bool, StoreError> {
        // room_shapes rows go with the room via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_shapes(&self, room_id: Uuid) -> Result<HashMap<String, Shape>, StoreError> {
        let rows = sqlx::query_as::<_, (String, serde_json::Value)>(
            "SELECT key, shape FROM room_shapes WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        let mut shapes = HashMap::with_capacity(rows.len());
        for (key, value) in rows {
            match serde_json::from_value::<Shape>(value) {
                Ok(shape) => {
                    shapes.insert(key, shape);
                }
                Err(e) => tracing::warn!(%room_id, %key, error = %e, "skipping undecodable stored shape"),
            }
        }
        Ok(shapes)
    }

    async fn upsert_shapes(&self, room_id: Uuid, shapes: &[Shape]) -> Result<(), StoreError> {
        for shape in shapes {
            let value = serde_json::to_value(shape)?;
            sqlx::query(
                "INSERT INTO room_shapes (room_id, key, shape, updated_at) \
                 SELECT $1, $2, $3, now() WHERE EXISTS (SELECT 1 FROM rooms WHERE id = $1) \
                 ON CONFLICT (room_id, key) DO UPDATE SET shape = EXCLUDED.shape, updated_at = now()",
            )
            .bind(room_id)
            .bind(&shape.id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn delete_shapes(&self, room_id: Uuid, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM room_shapes WHERE room_id = $1 AND key = ANY($2)")
            .bind(room_id)
            .bind(keys)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
