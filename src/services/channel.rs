//! Channel service: join/part, presence relay, broadcast events.
//!
//! DESIGN
//! ======
//! A room is live while at least one connection has joined it. The first
//! join hydrates the shape map from the store; later joins read the live
//! map. Every join replies with a full snapshot (shapes, peer presence and
//! the caller's permissions), which doubles as the resync after a
//! reconnect: clients never replay a log.
//!
//! Presence is overwritten wholesale per connection and relayed to peers.
//! A departing connection's presence is removed and peers get a
//! `presence-leave` in the same critical section, so nobody can observe a
//! stale cursor for a connection that is gone.
//!
//! ERROR HANDLING
//! ==============
//! Storage frames go out through `publish`, which drops a member whose
//! queue is full rather than let it silently miss a write.
//!
//! On last-client part, pending shape writes are flushed before eviction.
//! If that flush fails, the room stays in memory with its pending marks
//! intact and the persistence task retries.

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::StoreError;
use crate::frame::{ErrorCode, Frame, Message, Snapshot};
use crate::model::{BroadcastEvent, Presence, Shape};
use crate::rate_limit::RateLimitError;
use crate::services::permission::{CanvasPermission, permissions_for};
use crate::services::persistence::PendingWrites;
use crate::state::{AppState, ConnectedClient, Outbox, RoomState};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("not authorized")]
    Unauthorized,
    #[error("not joined to room {0}")]
    NotJoined(Uuid),
    #[error("invalid message: {0}")]
    Validation(String),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for ChannelError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "E_UNAUTHORIZED",
            Self::NotJoined(_) => "E_NOT_JOINED",
            Self::Validation(_) => "E_VALIDATION",
            Self::RateLimited(e) => e.error_code(),
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::RateLimited(e) => e.retryable(),
            Self::Store(e) => e.retryable(),
            _ => false,
        }
    }
}

fn snapshot_of(room: &RoomState, client_id: Uuid, permissions: CanvasPermission) -> Snapshot {
    let mut shapes: Vec<Shape> = room.shapes.values().cloned().collect();
    shapes.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
    Snapshot { shapes, peers: room.peers(Some(client_id)), permissions }
}

// =============================================================================
// JOIN / PART
// =============================================================================

/// Join a room, hydrating it from the store if it is not live yet. Joining
/// a room the connection is already in returns a fresh snapshot.
///
/// # Errors
///
/// `Unauthorized` without `canView` (or for an unknown room), `Store` if
/// hydration fails.
pub async fn join_room(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    client_id: Uuid,
    outbox: Outbox,
) -> Result<Snapshot, ChannelError> {
    let permissions = permissions_for(state.store.as_ref(), room_id, user_id).await;
    if !permissions.can_view {
        warn!(%room_id, %user_id, "join denied");
        return Err(ChannelError::Unauthorized);
    }

    let mut hydration: Option<(std::collections::HashMap<String, Shape>, u64)> = None;
    loop {
        let mut rooms = state.rooms.write().await;
        let epoch = state.evictions();
        let room = match (rooms.contains_key(&room_id), hydration.take()) {
            (true, _) => rooms.get_mut(&room_id),
            (false, Some((shapes, loaded_at))) if loaded_at == epoch => {
                info!(%room_id, count = shapes.len(), "hydrated room from store");
                Some(rooms.entry(room_id).or_insert(RoomState { shapes, ..RoomState::new() }))
            }
            (false, _) => None,
        };

        if let Some(room) = room {
            room.clients
                .entry(client_id)
                .or_insert_with(|| ConnectedClient { user_id, outbox, presence: None });
            info!(%room_id, %client_id, clients = room.clients.len(), "client joined room");
            return Ok(snapshot_of(room, client_id, permissions));
        }

        // Load outside the lock. An eviction before we relock may have
        // flushed newer writes than this read saw, so it is loaded again.
        drop(rooms);
        let shapes = state.store.load_shapes(room_id).await?;
        hydration = Some((shapes, epoch));
    }
}

/// Leave a room. Peers see the connection's presence disappear. The last
/// client out flushes pending writes and evicts the room.
pub async fn part_room(state: &AppState, room_id: Uuid, client_id: Uuid) {
    state.rate_limiter.forget(client_id);

    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(&room_id) else {
        return;
    };
    if room.clients.remove(&client_id).is_none() {
        return;
    }

    let leave = Frame::request(Message::PresenceLeave).with_room_id(room_id).with_from(client_id);
    send_to_clients(room, &leave, None);
    info!(%room_id, %client_id, remaining = room.clients.len(), "client left room");

    if !room.clients.is_empty() {
        return;
    }
    if !room.has_pending_writes() {
        rooms.remove(&room_id);
        state.record_eviction();
        info!(%room_id, "evicted room from memory");
        return;
    }

    // Write outside the lock; keep marks until the write has succeeded.
    let pending = PendingWrites::capture(room);
    drop(rooms);
    let result = pending.write(state.store.as_ref(), room_id).await;

    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(&room_id) else {
        return;
    };
    if !room.clients.is_empty() {
        if result.is_ok() {
            pending.acknowledge(room);
        }
        return;
    }

    match result {
        Ok(()) => {
            pending.acknowledge(room);
            if room.has_pending_writes() {
                warn!(%room_id, "retaining room after final flush because newer writes exist");
            } else {
                rooms.remove(&room_id);
                state.record_eviction();
                info!(%room_id, "evicted room from memory");
            }
        }
        Err(e) => error!(error = %e, %room_id, "final flush failed; room retained for retry"),
    }
}

/// Evict a deleted room's live state and tell every participant.
pub async fn close_room(state: &AppState, room_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    let Some(mut room) = rooms.remove(&room_id) else {
        return;
    };
    state.record_eviction();
    drop(rooms);

    let frame = Frame::request(Message::RoomDeleted).with_room_id(room_id);
    let clients: Vec<Uuid> = room.clients.keys().copied().collect();
    publish(&mut room, room_id, &frame);
    for client_id in clients {
        state.rate_limiter.forget(client_id);
    }
    info!(%room_id, clients = room.clients.len(), "closed deleted room");
}

// =============================================================================
// PRESENCE / EVENTS
// =============================================================================

/// Replace the connection's presence and relay it to peers. Returns `false`
/// when the update was dropped by the rate limiter.
///
/// # Errors
///
/// `Validation` for an oversized record, `NotJoined` if the connection is
/// not in the room.
pub async fn set_presence(
    state: &AppState,
    room_id: Uuid,
    client_id: Uuid,
    presence: Presence,
) -> Result<bool, ChannelError> {
    presence.validate().map_err(ChannelError::Validation)?;
    if state.rate_limiter.check_presence(client_id).is_err() {
        return Ok(false);
    }

    let mut rooms = state.rooms.write().await;
    let client = rooms
        .get_mut(&room_id)
        .and_then(|room| room.clients.get_mut(&client_id))
        .ok_or(ChannelError::NotJoined(room_id))?;
    client.presence = Some(presence.clone());

    let frame = Frame::request(Message::PresenceUpdate(presence))
        .with_room_id(room_id)
        .with_from(client_id);
    if let Some(room) = rooms.get(&room_id) {
        send_to_clients(room, &frame, Some(client_id));
    }
    Ok(true)
}

/// Deliver a one-shot event to every other connection currently in the room.
///
/// # Errors
///
/// `Validation` for a malformed event, `RateLimited` over quota, `NotJoined`
/// if the connection is not in the room.
pub async fn broadcast_event(
    state: &AppState,
    room_id: Uuid,
    client_id: Uuid,
    event: BroadcastEvent,
) -> Result<(), ChannelError> {
    event.validate().map_err(ChannelError::Validation)?;
    state.rate_limiter.check_broadcast(client_id)?;

    let rooms = state.rooms.read().await;
    let room = rooms
        .get(&room_id)
        .filter(|room| room.clients.contains_key(&client_id))
        .ok_or(ChannelError::NotJoined(room_id))?;

    let frame = Frame::request(Message::BroadcastEvent(event))
        .with_room_id(room_id)
        .with_from(client_id);
    send_to_clients(room, &frame, Some(client_id));
    Ok(())
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Best-effort fan-out for presence and one-shot events: a client whose
/// queue is full misses the frame.
pub(crate) fn send_to_clients(room: &RoomState, frame: &Frame, exclude: Option<Uuid>) {
    for (client_id, client) in &room.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        let _ = client.outbox.tx.try_send(frame.clone());
    }
}

/// Fan-out for frames no member may miss (storage writes, room deletion).
/// A client that cannot take the frame is dropped from the room and told to
/// disconnect; the join after its reconnect resyncs it from a snapshot.
/// Returns the dropped connection ids.
pub(crate) fn publish(room: &mut RoomState, room_id: Uuid, frame: &Frame) -> Vec<Uuid> {
    let lagging: Vec<Uuid> = room
        .clients
        .iter()
        .filter(|(_, client)| client.outbox.tx.try_send(frame.clone()).is_err())
        .map(|(client_id, _)| *client_id)
        .collect();

    for client_id in &lagging {
        if let Some(client) = room.clients.remove(client_id) {
            client.outbox.evicted.notify_one();
        }
        warn!(%room_id, %client_id, "dropped client that fell behind");
        let leave = Frame::request(Message::PresenceLeave).with_room_id(room_id).with_from(*client_id);
        send_to_clients(room, &leave, None);
    }
    lagging
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
