//! Client-side presence: own record, peers, and on-screen reactions.
//!
//! The local record is replaced wholesale on every update; callers spread
//! unchanged fields themselves. Outgoing updates are throttled to one per
//! `interval`. An update inside the window is held as pending and the
//! latest pending value goes out once the window elapses, so the final
//! cursor position is never lost.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{PeerPresence, Point, Presence};

/// A reaction currently on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedReaction {
    /// Connection that sent it, `None` for our own.
    pub from: Option<Uuid>,
    pub emoji: String,
    pub point: Point,
    pub shown_at: Instant,
}

#[derive(Debug)]
pub struct PresenceState {
    local: Presence,
    interval: Duration,
    last_sent: Option<Instant>,
    pending: bool,
    peers: HashMap<Uuid, Presence>,
    reactions: Vec<DisplayedReaction>,
    reaction_timeout: Duration,
}

impl PresenceState {
    #[must_use]
    pub fn new(interval: Duration, reaction_timeout: Duration) -> Self {
        Self {
            local: Presence::default(),
            interval,
            last_sent: None,
            pending: false,
            peers: HashMap::new(),
            reactions: Vec::new(),
            reaction_timeout,
        }
    }

    #[must_use]
    pub fn local(&self) -> &Presence {
        &self.local
    }

    // =========================================================================
    // OUTGOING
    // =========================================================================

    /// Overwrite the local record. Returns the record to send now, or `None`
    /// if the throttle window is still open (the update is kept as pending).
    pub fn update(&mut self, presence: Presence, now: Instant) -> Option<Presence> {
        self.local = presence;
        if self.window_open(now) {
            self.pending = true;
            return None;
        }
        Some(self.mark_sent(now))
    }

    /// The pending record if its window has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> Option<Presence> {
        if !self.pending || self.window_open(now) {
            return None;
        }
        Some(self.mark_sent(now))
    }

    /// When the pending record may be sent, if one is waiting.
    #[must_use]
    pub fn next_flush_at(&self) -> Option<Instant> {
        if !self.pending {
            return None;
        }
        Some(self.last_sent.map_or_else(Instant::now, |sent| sent + self.interval))
    }

    fn window_open(&self, now: Instant) -> bool {
        self.last_sent.is_some_and(|sent| now.saturating_duration_since(sent) < self.interval)
    }

    fn mark_sent(&mut self, now: Instant) -> Presence {
        self.last_sent = Some(now);
        self.pending = false;
        self.local.clone()
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    #[must_use]
    pub fn peers(&self) -> &HashMap<Uuid, Presence> {
        &self.peers
    }

    /// Replace a peer's record wholesale.
    pub fn apply_peer(&mut self, connection_id: Uuid, presence: Presence) {
        self.peers.insert(connection_id, presence);
    }

    /// Returns whether the peer was known.
    pub fn remove_peer(&mut self, connection_id: Uuid) -> bool {
        self.peers.remove(&connection_id).is_some()
    }

    /// Peers from a snapshot; peers without presence yet are listed too.
    pub fn reset_peers(&mut self, peers: Vec<PeerPresence>) {
        self.peers = peers.into_iter().map(|peer| (peer.connection_id, peer.presence)).collect();
    }

    /// Nobody is observably present while the connection is down.
    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    // =========================================================================
    // REACTIONS
    // =========================================================================

    pub fn show_reaction(&mut self, from: Option<Uuid>, emoji: String, point: Point, now: Instant) {
        self.reactions.push(DisplayedReaction { from, emoji, point, shown_at: now });
    }

    /// Drop reactions older than the display timeout. Returns how many went.
    pub fn expire_reactions(&mut self, now: Instant) -> usize {
        let before = self.reactions.len();
        let timeout = self.reaction_timeout;
        self.reactions.retain(|r| now.saturating_duration_since(r.shown_at) < timeout);
        before - self.reactions.len()
    }

    #[must_use]
    pub fn reactions(&self) -> &[DisplayedReaction] {
        &self.reactions
    }

    /// When the oldest reaction on screen expires.
    #[must_use]
    pub fn next_expiry_at(&self) -> Option<Instant> {
        self.reactions.iter().map(|r| r.shown_at + self.reaction_timeout).min()
    }
}
