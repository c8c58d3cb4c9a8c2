use super::*;
use crate::config::Config;
use crate::db::{MemoryRoomStore, RoomStore};
use crate::model::{Point, Room, WorkspaceRole};
use crate::services::shapes;
use crate::state::test_helpers::{seed_room, shape, test_app_state};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, timeout};

async fn assert_channel_has_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

async fn join(state: &AppState, room_id: Uuid, user_id: Uuid) -> (Uuid, mpsc::Receiver<Frame>, Snapshot) {
    let client_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(32);
    let snapshot = join_room(state, room_id, user_id, client_id, Outbox::new(tx)).await.unwrap();
    (client_id, rx, snapshot)
}

fn cursor_at(x: f64, y: f64) -> Presence {
    Presence { cursor: Some(Point { x, y }), ..Presence::default() }
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn first_join_hydrates_from_store() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    store.upsert_shapes(room.id, &[shape("a"), shape("b")]).await.unwrap();

    let (_, _rx, snapshot) = join(&state, room.id, owner).await;
    assert_eq!(snapshot.shapes.len(), 2);
    assert!(snapshot.permissions.can_edit);
    assert!(snapshot.peers.is_empty());
}

#[tokio::test]
async fn join_without_view_is_unauthorized() {
    let (state, store) = test_app_state();
    let (room, _) = seed_room(&store).await;
    let (tx, _rx) = mpsc::channel(4);

    let result = join_room(&state, room.id, Uuid::new_v4(), Uuid::new_v4(), Outbox::new(tx)).await;
    assert!(matches!(result, Err(ChannelError::Unauthorized)));
    assert!(state.rooms.read().await.is_empty());
}

#[tokio::test]
async fn later_join_sees_live_map_not_store() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (_, _rx_a, _) = join(&state, room.id, owner).await;

    shapes::put_shape(&state, room.id, owner, Uuid::nil(), "live", shape("live")).await.unwrap();
    let (_, _rx_b, snapshot) = join(&state, room.id, owner).await;

    assert!(snapshot.shapes.iter().any(|s| s.id == "live"));
    assert!(store.load_shapes(room.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn rejoin_resyncs_with_full_snapshot() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let client_id = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(8);
    join_room(&state, room.id, owner, client_id, Outbox::new(tx.clone())).await.unwrap();
    shapes::put_shape(&state, room.id, owner, Uuid::nil(), "a", shape("a")).await.unwrap();

    let snapshot = join_room(&state, room.id, owner, client_id, Outbox::new(tx)).await.unwrap();
    assert_eq!(snapshot.shapes.len(), 1);
    assert_eq!(state.rooms.read().await[&room.id].clients.len(), 1);
}

#[tokio::test]
async fn snapshot_orders_shapes_by_z_index() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let top = Shape { z_index: 5, ..shape("top") };
    let bottom = Shape { z_index: -1, ..shape("bottom") };
    store.upsert_shapes(room.id, &[top, bottom]).await.unwrap();

    let (_, _rx, snapshot) = join(&state, room.id, owner).await;
    let ids = snapshot.shapes.iter().map(|s| s.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["bottom", "top"]);
}

// =============================================================================
// PRESENCE
// =============================================================================

#[tokio::test]
async fn presence_reaches_peers_but_not_sender() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, mut rx_a, _) = join(&state, room.id, owner).await;
    let (_, mut rx_b, _) = join(&state, room.id, owner).await;

    assert!(set_presence(&state, room.id, a, cursor_at(1.0, 2.0)).await.unwrap());

    let frame = assert_channel_has_frame(&mut rx_b).await;
    assert_eq!(frame.from, Some(a));
    assert_eq!(frame.body, Message::PresenceUpdate(cursor_at(1.0, 2.0)));
    assert_channel_empty(&mut rx_a).await;
}

#[tokio::test]
async fn presence_is_replaced_wholesale_and_shows_in_snapshots() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx_a, _) = join(&state, room.id, owner).await;

    let drawing = Presence { selection: Some(vec!["x".into()]), color: "#ff0000".into(), ..cursor_at(1.0, 1.0) };
    set_presence(&state, room.id, a, drawing).await.unwrap();
    set_presence(&state, room.id, a, cursor_at(9.0, 9.0)).await.unwrap();

    let (_, _rx_b, snapshot) = join(&state, room.id, owner).await;
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].connection_id, a);
    assert_eq!(snapshot.peers[0].presence, cursor_at(9.0, 9.0));
}

#[tokio::test]
async fn part_removes_presence_and_notifies_peers() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx_a, _) = join(&state, room.id, owner).await;
    let (b, mut rx_b, _) = join(&state, room.id, owner).await;
    set_presence(&state, room.id, a, cursor_at(0.0, 0.0)).await.unwrap();
    let _ = assert_channel_has_frame(&mut rx_b).await;

    part_room(&state, room.id, a).await;

    let frame = assert_channel_has_frame(&mut rx_b).await;
    assert_eq!(frame.body, Message::PresenceLeave);
    assert_eq!(frame.from, Some(a));
    assert!(state.rooms.read().await[&room.id].peers(Some(b)).is_empty());
}

#[tokio::test]
async fn presence_before_join_is_rejected() {
    let (state, store) = test_app_state();
    let (room, _) = seed_room(&store).await;
    let result = set_presence(&state, room.id, Uuid::new_v4(), Presence::default()).await;
    assert!(matches!(result, Err(ChannelError::NotJoined(_))));
}

// =============================================================================
// BROADCAST EVENTS
// =============================================================================

#[tokio::test]
async fn broadcast_event_is_fire_and_forget_to_current_peers() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, mut rx_a, _) = join(&state, room.id, owner).await;
    let (_, mut rx_b, _) = join(&state, room.id, owner).await;

    let event = BroadcastEvent::Chat { text: "hello".into() };
    broadcast_event(&state, room.id, a, event.clone()).await.unwrap();

    let frame = assert_channel_has_frame(&mut rx_b).await;
    assert_eq!(frame.body, Message::BroadcastEvent(event));
    assert_channel_empty(&mut rx_a).await;

    // A peer joining afterwards never sees it.
    let (_, mut rx_c, _) = join(&state, room.id, owner).await;
    assert_channel_empty(&mut rx_c).await;
}

#[tokio::test]
async fn invalid_broadcast_event_is_rejected() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx, _) = join(&state, room.id, owner).await;

    let result = broadcast_event(&state, room.id, a, BroadcastEvent::Chat { text: "   ".into() }).await;
    assert!(matches!(result, Err(ChannelError::Validation(_))));
}

#[tokio::test]
async fn broadcast_events_are_rate_limited() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx, _) = join(&state, room.id, owner).await;

    let limit = state.config.broadcast_events_per_window;
    for _ in 0..limit {
        broadcast_event(&state, room.id, a, BroadcastEvent::Chat { text: "hi".into() }).await.unwrap();
    }
    let result = broadcast_event(&state, room.id, a, BroadcastEvent::Chat { text: "hi".into() }).await;
    let err = result.unwrap_err();
    assert_eq!(err.error_code(), "E_RATE_LIMITED");
    assert!(err.retryable());
}

// =============================================================================
// PART / CLOSE
// =============================================================================

#[tokio::test]
async fn last_part_flushes_then_evicts() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx, _) = join(&state, room.id, owner).await;
    shapes::put_shape(&state, room.id, owner, Uuid::nil(), "a", shape("a")).await.unwrap();

    part_room(&state, room.id, a).await;

    assert!(!state.rooms.read().await.contains_key(&room.id));
    assert!(store.load_shapes(room.id).await.unwrap().contains_key("a"));
}

#[tokio::test]
async fn failed_final_flush_retains_room() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx, _) = join(&state, room.id, owner).await;
    shapes::put_shape(&state, room.id, owner, Uuid::nil(), "a", shape("a")).await.unwrap();

    store.set_failing(true);
    part_room(&state, room.id, a).await;

    let rooms = state.rooms.read().await;
    let live = rooms.get(&room.id).expect("room should be retained");
    assert!(live.dirty.contains_key("a"));
}

#[tokio::test]
async fn close_room_notifies_everyone_and_evicts() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let viewer = Uuid::new_v4();
    store.add_member(room.workspace_id, viewer, WorkspaceRole::Member).await;
    let (_, mut rx_a, _) = join(&state, room.id, owner).await;
    let (_, mut rx_b, _) = join(&state, room.id, viewer).await;

    close_room(&state, room.id).await;

    assert_eq!(assert_channel_has_frame(&mut rx_a).await.body, Message::RoomDeleted);
    assert_eq!(assert_channel_has_frame(&mut rx_b).await.body, Message::RoomDeleted);
    assert!(!state.rooms.read().await.contains_key(&room.id));
}

#[tokio::test]
async fn oversized_presence_is_refused_and_not_relayed() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx_a, _) = join(&state, room.id, owner).await;
    let (_, mut rx_b, _) = join(&state, room.id, owner).await;

    let flood = Presence { selection: Some(vec!["s".into(); 10_000]), ..Presence::default() };
    let result = set_presence(&state, room.id, a, flood).await;
    assert!(matches!(result, Err(ChannelError::Validation(_))));
    assert_channel_empty(&mut rx_b).await;
    assert!(state.rooms.read().await[&room.id].clients[&a].presence.is_none());
}

// =============================================================================
// SLOW CONSUMERS
// =============================================================================

#[tokio::test]
async fn overflowing_storage_frame_drops_member_and_signals_it() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (_, mut rx_a, _) = join(&state, room.id, owner).await;

    let slow = Uuid::new_v4();
    let (tx, _slow_rx) = mpsc::channel(1);
    let outbox = Outbox::new(tx);
    join_room(&state, room.id, owner, slow, outbox.clone()).await.unwrap();

    shapes::put_shape(&state, room.id, owner, Uuid::nil(), "a", shape("a")).await.unwrap();
    shapes::put_shape(&state, room.id, owner, Uuid::nil(), "b", shape("b")).await.unwrap();

    timeout(Duration::from_millis(200), outbox.evicted.notified())
        .await
        .expect("slow member was not told to disconnect");
    assert!(!state.rooms.read().await[&room.id].clients.contains_key(&slow));

    let mut kinds = Vec::new();
    while let Ok(frame) = rx_a.try_recv() {
        kinds.push(frame.body.kind());
    }
    assert_eq!(kinds, ["storage-put", "storage-put", "presence-leave"]);
}

#[tokio::test]
async fn presence_overflow_is_skipped_without_dropping() {
    let (state, store) = test_app_state();
    let (room, owner) = seed_room(&store).await;
    let (a, _rx_a, _) = join(&state, room.id, owner).await;

    let slow = Uuid::new_v4();
    let (tx, _slow_rx) = mpsc::channel(1);
    join_room(&state, room.id, owner, slow, Outbox::new(tx)).await.unwrap();

    set_presence(&state, room.id, a, cursor_at(1.0, 1.0)).await.unwrap();
    set_presence(&state, room.id, a, cursor_at(2.0, 2.0)).await.unwrap();

    assert!(state.rooms.read().await[&room.id].clients.contains_key(&slow));
}

// =============================================================================
// HYDRATION RACE
// =============================================================================

/// Memory store whose next `load_shapes` returns its read, then stalls until
/// released.
#[derive(Default)]
struct StallingStore {
    inner: MemoryRoomStore,
    stall_next_load: AtomicBool,
    loaded: Notify,
    release: Notify,
}

#[async_trait::async_trait]
impl RoomStore for StallingStore {
    async fn user_for_session(&self, token: &str) -> Result<Option<Uuid>, StoreError> {
        self.inner.user_for_session(token).await
    }

    async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<WorkspaceRole>, StoreError> {
        self.inner.membership(workspace_id, user_id).await
    }

    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        self.inner.get_room(room_id).await
    }

    async fn list_rooms(&self, workspace_id: Uuid) -> Result<Vec<Room>, StoreError> {
        self.inner.list_rooms(workspace_id).await
    }

    async fn insert_room(&self, room: &Room) -> Result<(), StoreError> {
        self.inner.insert_room(room).await
    }

    async fn update_room(&self, room: &Room) -> Result<bool, StoreError> {
        self.inner.update_room(room).await
    }

    async fn delete_room(&self, room_id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete_room(room_id).await
    }

    async fn load_shapes(&self, room_id: Uuid) -> Result<HashMap<String, Shape>, StoreError> {
        let shapes = self.inner.load_shapes(room_id).await?;
        if self.stall_next_load.swap(false, Ordering::SeqCst) {
            self.loaded.notify_one();
            self.release.notified().await;
        }
        Ok(shapes)
    }

    async fn upsert_shapes(&self, room_id: Uuid, shapes: &[Shape]) -> Result<(), StoreError> {
        self.inner.upsert_shapes(room_id, shapes).await
    }

    async fn delete_shapes(&self, room_id: Uuid, keys: &[String]) -> Result<(), StoreError> {
        self.inner.delete_shapes(room_id, keys).await
    }
}

#[tokio::test]
async fn join_racing_a_flush_and_evict_does_not_revive_old_shapes() {
    let store = Arc::new(StallingStore::default());
    let state = AppState::new(store.clone(), Config::default());
    let (room, owner) = seed_room(&store.inner).await;
    store.inner.upsert_shapes(room.id, &[shape("a")]).await.unwrap();

    // First joiner reads the store, then stalls before taking the lock.
    store.stall_next_load.store(true, Ordering::SeqCst);
    let (tx, _rx_late) = mpsc::channel(32);
    let late = tokio::spawn({
        let state = state.clone();
        async move { join_room(&state, room.id, owner, Uuid::new_v4(), Outbox::new(tx)).await }
    });
    store.loaded.notified().await;

    // Meanwhile another client hydrates, writes, leaves: flushed and evicted.
    let (b, _rx_b, _) = join(&state, room.id, owner).await;
    shapes::put_shape(&state, room.id, owner, b, "a", Shape { x: 5.0, ..shape("a") }).await.unwrap();
    part_room(&state, room.id, b).await;
    assert!(state.rooms.read().await.is_empty());

    store.release.notify_one();
    let snapshot = late.await.unwrap().unwrap();
    assert_eq!(snapshot.shapes.len(), 1);
    assert!((snapshot.shapes[0].x - 5.0).abs() < f64::EPSILON);
    assert!((state.rooms.read().await[&room.id].shapes["a"].x - 5.0).abs() < f64::EPSILON);
}
