//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the backing store and a map of live room states. Each live room
//! has its own in-memory shape map, connected clients with their presence,
//! and dirty bookkeeping for debounced persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Notify, RwLock, mpsc};
use uuid::Uuid;

use crate::config::Config;
use crate::db::RoomStore;
use crate::frame::Frame;
use crate::model::{PeerPresence, Presence, Shape};
use crate::rate_limit::RateLimiter;

// =============================================================================
// ROOM STATE
// =============================================================================

/// Outbound side of one connection: its frame queue, and the signal raised
/// when a room drops it for falling behind.
#[derive(Clone)]
pub struct Outbox {
    pub tx: mpsc::Sender<Frame>,
    pub evicted: Arc<Notify>,
}

impl Outbox {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx, evicted: Arc::new(Notify::new()) }
    }
}

/// One websocket connection joined to a room.
pub struct ConnectedClient {
    pub user_id: Uuid,
    pub outbox: Outbox,
    /// Last presence the client sent. `None` until its first update.
    pub presence: Option<Presence>,
}

/// Per-room live state. Kept in memory while any client is connected and
/// flushed to the store by the persistence task.
#[derive(Default)]
pub struct RoomState {
    /// Canonical shape map, keyed by shape id.
    pub shapes: HashMap<String, Shape>,
    /// Connected clients: `client_id` -> connection.
    pub clients: HashMap<Uuid, ConnectedClient>,
    /// Keys written since last flush, with the write sequence that dirtied them.
    pub dirty: HashMap<String, u64>,
    /// Keys deleted since last flush, with the write sequence of the delete.
    pub deleted: HashMap<String, u64>,
    /// Monotonic write counter for this room.
    pub seq: u64,
}

impl RoomState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Presence of every client that has sent one, excluding `exclude`.
    #[must_use]
    pub fn peers(&self, exclude: Option<Uuid>) -> Vec<PeerPresence> {
        self.clients
            .iter()
            .filter(|(client_id, _)| exclude != Some(**client_id))
            .filter_map(|(client_id, client)| {
                client.presence.clone().map(|presence| PeerPresence {
                    connection_id: *client_id,
                    user_id: client.user_id,
                    presence,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.dirty.is_empty() || !self.deleted.is_empty()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RoomStore>,
    pub rooms: Arc<RwLock<HashMap<Uuid, RoomState>>>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<Config>,
    /// Bumped whenever a live room is dropped from `rooms`.
    evictions: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn RoomStore>, config: Config) -> Self {
        Self {
            store,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            rate_limiter: RateLimiter::new(&config),
            config: Arc::new(config),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count a room eviction. Call while holding the `rooms` write lock.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }

    /// Evictions so far. Unchanged across a stretch of time means no room
    /// left memory, so no flush landed in the store for an absent room.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::SeqCst)
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_state_new_is_empty() {
        let rs = RoomState::new();
        assert!(rs.shapes.is_empty());
        assert!(rs.clients.is_empty());
        assert!(!rs.has_pending_writes());
        assert_eq!(rs.seq, 0);
    }

    #[test]
    fn peers_skip_clients_without_presence_and_the_excluded_one() {
        let mut rs = RoomState::new();
        let (tx, _rx) = mpsc::channel(1);
        let outbox = Outbox::new(tx);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        rs.clients.insert(a, ConnectedClient { user_id: a, outbox: outbox.clone(), presence: Some(Presence::default()) });
        rs.clients.insert(b, ConnectedClient { user_id: b, outbox: outbox.clone(), presence: None });
        rs.clients.insert(c, ConnectedClient { user_id: c, outbox, presence: Some(Presence::default()) });

        let peers = rs.peers(Some(c));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].connection_id, a);
    }
}
