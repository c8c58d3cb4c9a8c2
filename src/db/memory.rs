//! In-process [`RoomStore`] used for local runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RoomStore, StoreError, generate_token};
use crate::model::{Room, Shape, WorkspaceRole};

#[derive(Default)]
struct Tables {
    rooms: HashMap<Uuid, Room>,
    members: HashMap<(Uuid, Uuid), WorkspaceRole>,
    sessions: HashMap<String, Uuid>,
    shapes: HashMap<Uuid, HashMap<String, Shape>>,
}

#[derive(Default)]
pub struct MemoryRoomStore {
    tables: RwLock<Tables>,
    failing: AtomicBool,
}

impl MemoryRoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `user_id` a role in `workspace_id`.
    pub async fn add_member(&self, workspace_id: Uuid, user_id: Uuid, role: WorkspaceRole) {
        self.tables.write().await.members.insert((workspace_id, user_id), role);
    }

    /// Issue a session token for `user_id`.
    pub async fn issue_session(&self, user_id: Uuid) -> String {
        let token = generate_token();
        self.tables.write().await.sessions.insert(token.clone(), user_id);
        token
    }

    /// Make every subsequent call fail, simulating an unreachable backend.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn user_for_session(&self, token: &str) -> Result<Option<Uuid>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.sessions.get(token).copied())
    }

    async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<WorkspaceRole>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.members.get(&(workspace_id, user_id)).copied())
    }

    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.rooms.get(&room_id).cloned())
    }

    async fn list_rooms(&self, workspace_id: Uuid) -> Result<Vec<Room>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut rooms = tables
            .rooms
            .values()
            .filter(|room| room.workspace_id == workspace_id)
            .cloned()
            .collect::<Vec<_>>();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(rooms)
    }

    async fn insert_room(&self, room: &Room) -> Result<(), StoreError> {
        self.check()?;
        self.tables.write().await.rooms.insert(room.id, room.clone());
        Ok(())
    }

    async fn update_room(&self, room: &Room) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let Some(existing) = tables.rooms.get_mut(&room.id) else {
            return Ok(false);
        };
        *existing = room.clone();
        Ok(true)
    }

    async fn delete_room(&self, room_id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.shapes.remove(&room_id);
        Ok(tables.rooms.remove(&room_id).is_some())
    }

    async fn load_shapes(&self, room_id: Uuid) -> Result<HashMap<String, Shape>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.shapes.get(&room_id).cloned().unwrap_or_default())
    }

    async fn upsert_shapes(&self, room_id: Uuid, shapes: &[Shape]) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&room_id) {
            return Ok(());
        }
        let stored = tables.shapes.entry(room_id).or_default();
        for shape in shapes {
            stored.insert(shape.id.clone(), shape.clone());
        }
        Ok(())
    }

    async fn delete_shapes(&self, room_id: Uuid, keys: &[String]) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some(stored) = tables.shapes.get_mut(&room_id) {
            for key in keys {
                stored.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_helpers::{room_record, shape};

    #[tokio::test]
    async fn list_rooms_is_newest_first_and_scoped() {
        let store = MemoryRoomStore::new();
        let workspace = Uuid::new_v4();
        let owner = Uuid::new_v4();

        let mut older = room_record(workspace, owner);
        older.created_at -= time::Duration::minutes(5);
        let newer = room_record(workspace, owner);
        let elsewhere = room_record(Uuid::new_v4(), owner);

        store.insert_room(&older).await.unwrap();
        store.insert_room(&newer).await.unwrap();
        store.insert_room(&elsewhere).await.unwrap();

        let ids = store
            .list_rooms(workspace)
            .await
            .unwrap()
            .into_iter()
            .map(|room| room.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn update_missing_room_reports_false() {
        let store = MemoryRoomStore::new();
        let room = room_record(Uuid::new_v4(), Uuid::new_v4());
        assert!(!store.update_room(&room).await.unwrap());
    }

    #[tokio::test]
    async fn shapes_for_deleted_room_are_dropped() {
        let store = MemoryRoomStore::new();
        let room = room_record(Uuid::new_v4(), Uuid::new_v4());
        store.insert_room(&room).await.unwrap();
        store.upsert_shapes(room.id, &[shape("a")]).await.unwrap();
        assert_eq!(store.load_shapes(room.id).await.unwrap().len(), 1);

        assert!(store.delete_room(room.id).await.unwrap());
        store.upsert_shapes(room.id, &[shape("b")]).await.unwrap();
        assert!(store.load_shapes(room.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_resolve_to_users() {
        let store = MemoryRoomStore::new();
        let user = Uuid::new_v4();
        let token = store.issue_session(user).await;
        assert_eq!(store.user_for_session(&token).await.unwrap(), Some(user));
        assert_eq!(store.user_for_session("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_store_errors_everywhere() {
        let store = MemoryRoomStore::new();
        store.set_failing(true);
        assert!(matches!(store.get_room(Uuid::new_v4()).await, Err(StoreError::Unavailable(_))));
        assert!(store.membership(Uuid::new_v4(), Uuid::new_v4()).await.is_err());
        store.set_failing(false);
        assert!(store.get_room(Uuid::new_v4()).await.unwrap().is_none());
    }
}
