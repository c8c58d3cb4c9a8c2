//! Persistence service: debounced flush of dirty shapes to the store.
//!
//! DESIGN
//! ======
//! Shape writes land in memory first (see `services::shapes`) and record the
//! room's write sequence against the key in `dirty` or `deleted`. A
//! background task wakes every `SHAPE_FLUSH_INTERVAL_MS`, snapshots pending
//! keys under the lock, releases it, and writes to the store.
//!
//! A key's pending mark is cleared only when the write succeeded and the
//! mark still carries the sequence that was flushed. A newer write to the
//! same key during the I/O keeps it pending for the next tick.
//!
//! Live rooms that have lost all clients and have nothing left to write are
//! evicted here, which covers rooms kept alive by a failed final flush.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::db::{RoomStore, StoreError};
use crate::model::Shape;
use crate::state::{AppState, RoomState};

/// Writes captured from one room, with the sequence each key was captured at.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    upserts: Vec<Shape>,
    upsert_seqs: Vec<(String, u64)>,
    deletes: Vec<String>,
    delete_seqs: Vec<(String, u64)>,
}

impl PendingWrites {
    /// Snapshot pending keys without clearing them.
    pub(crate) fn capture(room: &RoomState) -> Self {
        let mut pending = Self::default();
        for (key, seq) in &room.dirty {
            if let Some(shape) = room.shapes.get(key) {
                pending.upserts.push(shape.clone());
                pending.upsert_seqs.push((key.clone(), *seq));
            }
        }
        for (key, seq) in &room.deleted {
            pending.deletes.push(key.clone());
            pending.delete_seqs.push((key.clone(), *seq));
        }
        pending
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }

    pub(crate) async fn write(&self, store: &dyn RoomStore, room_id: Uuid) -> Result<(), StoreError> {
        if !self.upserts.is_empty() {
            store.upsert_shapes(room_id, &self.upserts).await?;
        }
        if !self.deletes.is_empty() {
            store.delete_shapes(room_id, &self.deletes).await?;
        }
        Ok(())
    }

    /// Clear marks that still carry the flushed sequence.
    pub(crate) fn acknowledge(&self, room: &mut RoomState) {
        for (key, seq) in &self.upsert_seqs {
            if room.dirty.get(key) == Some(seq) {
                room.dirty.remove(key);
            }
        }
        for (key, seq) in &self.delete_seqs {
            if room.deleted.get(key) == Some(seq) {
                room.deleted.remove(key);
            }
        }
    }
}

/// Spawn the background persistence task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.shape_flush_interval);
        loop {
            interval.tick().await;
            flush_all_dirty(&state).await;
        }
    })
}

/// Flush every live room with pending writes, then evict idle clean rooms.
pub async fn flush_all_dirty(state: &AppState) {
    // Collect under the lock, then release before any I/O.
    let batches: HashMap<Uuid, PendingWrites> = {
        let rooms = state.rooms.read().await;
        rooms
            .iter()
            .filter(|(_, room)| room.has_pending_writes())
            .map(|(room_id, room)| (*room_id, PendingWrites::capture(room)))
            .collect()
    };

    let mut flushed = Vec::with_capacity(batches.len());
    for (room_id, pending) in batches {
        match pending.write(state.store.as_ref(), room_id).await {
            Ok(()) => {
                debug!(%room_id, count = pending.len(), "flushed shapes");
                flushed.push((room_id, pending));
            }
            Err(e) => error!(error = %e, %room_id, count = pending.len(), "persistence flush failed"),
        }
    }

    let mut rooms = state.rooms.write().await;
    for (room_id, pending) in &flushed {
        if let Some(room) = rooms.get_mut(room_id) {
            pending.acknowledge(room);
        }
    }
    rooms.retain(|room_id, room| {
        let keep = !room.clients.is_empty() || room.has_pending_writes();
        if !keep {
            state.record_eviction();
            info!(%room_id, "evicted idle room from memory");
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::shapes;
    use crate::state::test_helpers::{attach_client, seed_room, shape, test_app_state};

    #[tokio::test]
    async fn flush_writes_dirty_shapes_and_clears_marks() {
        let (state, store) = test_app_state();
        let (room, owner) = seed_room(&store).await;
        let _client = attach_client(&state, room.id, owner).await;

        shapes::put_shape(&state, room.id, owner, Uuid::nil(), "a", shape("a")).await.unwrap();
        flush_all_dirty(&state).await;

        assert!(store.load_shapes(room.id).await.unwrap().contains_key("a"));
        let rooms = state.rooms.read().await;
        assert!(!rooms[&room.id].has_pending_writes());
    }

    #[tokio::test]
    async fn flush_applies_deletes() {
        let (state, store) = test_app_state();
        let (room, owner) = seed_room(&store).await;
        store.upsert_shapes(room.id, &[shape("gone")]).await.unwrap();
        let _client = attach_client(&state, room.id, owner).await;
        state.rooms.write().await.get_mut(&room.id).unwrap().shapes.insert("gone".into(), shape("gone"));

        assert!(shapes::delete_shape(&state, room.id, owner, Uuid::nil(), "gone").await.unwrap());
        flush_all_dirty(&state).await;

        assert!(store.load_shapes(room.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_flush_keeps_marks_for_retry() {
        let (state, store) = test_app_state();
        let (room, owner) = seed_room(&store).await;
        let _client = attach_client(&state, room.id, owner).await;
        shapes::put_shape(&state, room.id, owner, Uuid::nil(), "a", shape("a")).await.unwrap();

        store.set_failing(true);
        flush_all_dirty(&state).await;
        assert!(state.rooms.read().await[&room.id].dirty.contains_key("a"));

        store.set_failing(false);
        flush_all_dirty(&state).await;
        assert!(store.load_shapes(room.id).await.unwrap().contains_key("a"));
    }

    #[test]
    fn newer_write_during_flush_stays_pending() {
        let mut room = RoomState::new();
        room.shapes.insert("a".into(), shape("a"));
        room.dirty.insert("a".into(), 1);
        let pending = PendingWrites::capture(&room);

        // A later write bumps the sequence while the flush is in flight.
        room.dirty.insert("a".into(), 2);
        pending.acknowledge(&mut room);
        assert_eq!(room.dirty.get("a"), Some(&2));
    }

    #[tokio::test]
    async fn idle_clean_rooms_are_evicted() {
        let (state, store) = test_app_state();
        let (room, _) = seed_room(&store).await;
        state.rooms.write().await.insert(room.id, RoomState::new());

        flush_all_dirty(&state).await;
        assert!(!state.rooms.read().await.contains_key(&room.id));
    }
}
