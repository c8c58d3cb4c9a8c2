//! One open room view: lease, gate, local store and presence together.
//!
//! DESIGN
//! ======
//! Every mutation goes through the same synchronous sequence:
//!
//! 1. Store synced? Otherwise `NotSynced` (loading state).
//! 2. Gate allows the permission? Otherwise `Forbidden`, and nothing is
//!    applied, not even locally.
//! 3. Reserve an outbound slot, apply locally, queue the frame.
//!
//! Incoming frames are turned into [`SessionEvent`]s by
//! [`RoomSession::handle`]; [`RoomSession::next_event`] wraps it with the
//! timers for throttled presence and reaction expiry.
//!
//! Closing a session only releases its lease. The server parts the room
//! when the socket closes, which happens with the last lease.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ChannelEvent, ConnectionRegistry, ConnectionStatus, RoomLease, Subscription};
use super::gate::PermissionGate;
use super::presence::PresenceState;
use super::store::LocalShapeStore;
use super::{ClientConfig, ClientError};
use crate::frame::{Frame, Message};
use crate::model::{BroadcastEvent, Point, Presence, Shape};
use crate::services::permission::Permission;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    /// Sending connection.
    pub from: Option<Uuid>,
    pub text: String,
}

/// Something the view should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    /// A snapshot replaced the local map.
    Synced,
    ShapeChanged(String),
    /// Every own write to the key was accepted; the shown value stands.
    ShapeSettled(String),
    /// A denied write was rolled back to the server's value.
    ShapeReverted(String),
    PeerUpdated(Uuid),
    PeerLeft(Uuid),
    Reaction { from: Option<Uuid>, emoji: String },
    ReactionsExpired,
    Chat(ChatLine),
    ServerError { code: String, message: String },
    RoomDeleted,
}

pub struct RoomSession {
    room_id: Uuid,
    user_id: Uuid,
    lease: RoomLease,
    subscription: Subscription,
    gate: Arc<PermissionGate>,
    store: LocalShapeStore,
    presence: PresenceState,
    status: ConnectionStatus,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl RoomSession {
    /// Resolve permissions, lease the room connection and request a snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be opened or the join cannot be queued.
    /// A failed permission fetch is not an error: the gate reports `Failed`.
    pub async fn open(
        registry: &ConnectionRegistry,
        gate: Arc<PermissionGate>,
        room_id: Uuid,
        user_id: Uuid,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        gate.prime(room_id).await;
        let lease = registry.open(room_id).await?;
        let subscription = lease.connection().subscribe();
        let status = subscription.status();

        let session = Self {
            room_id,
            user_id,
            lease,
            subscription,
            gate,
            store: LocalShapeStore::new(),
            presence: PresenceState::new(config.presence_interval, config.reaction_timeout),
            status,
        };
        session.lease.connection().try_send(session.frame(Message::Join))?;
        info!(%room_id, %user_id, "session: opened");
        Ok(session)
    }

    /// Release the connection lease.
    pub fn close(self) {
        info!(room_id = %self.room_id, user_id = %self.user_id, "session: closed");
        self.lease.close();
    }

    #[must_use]
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.store.is_synced()
    }

    #[must_use]
    pub fn shapes(&self) -> &LocalShapeStore {
        &self.store
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceState {
        &self.presence
    }

    #[must_use]
    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Same answer the mutation methods use.
    #[must_use]
    pub fn can(&self, permission: Permission) -> bool {
        self.gate.allows(self.room_id, permission)
    }

    fn frame(&self, body: Message) -> Frame {
        Frame::request(body).with_room_id(self.room_id)
    }

    fn guard(&self, permission: Permission) -> Result<(), ClientError> {
        if !self.store.is_synced() {
            return Err(ClientError::NotSynced);
        }
        if !self.can(permission) {
            debug!(room_id = %self.room_id, permission = permission.as_str(), "session: blocked by gate");
            return Err(ClientError::Forbidden(permission));
        }
        Ok(())
    }
}

// =============================================================================
// MUTATIONS
// =============================================================================

impl RoomSession {
    /// Create or replace a shape.
    ///
    /// # Errors
    ///
    /// `NotSynced`, `Forbidden(Edit)`, `Invalid` for a malformed shape, or a
    /// full/closed outbound queue. Local state is untouched on error.
    pub fn put_shape(&mut self, shape: Shape) -> Result<(), ClientError> {
        self.guard(Permission::Edit)?;
        shape.validate().map_err(ClientError::Invalid)?;

        let frame = self.frame(Message::StoragePut { key: shape.id.clone(), shape: shape.clone() });
        let permit = self.lease.connection().try_reserve()?;
        self.store.put_local(shape);
        permit.send(frame);
        Ok(())
    }

    /// Delete a shape. Returns `false` when it is not in the local map.
    ///
    /// # Errors
    ///
    /// Same as [`RoomSession::put_shape`].
    pub fn delete_shape(&mut self, key: &str) -> Result<bool, ClientError> {
        self.guard(Permission::Edit)?;
        if self.store.get(key).is_none() {
            return Ok(false);
        }

        let frame = self.frame(Message::StorageDelete { key: key.to_owned() });
        let permit = self.lease.connection().try_reserve()?;
        self.store.delete_local(key);
        permit.send(frame);
        Ok(true)
    }

    /// Raise a shape above all others. Returns `false` when it is absent.
    ///
    /// # Errors
    ///
    /// Same as [`RoomSession::put_shape`].
    pub fn bring_to_front(&mut self, key: &str) -> Result<bool, ClientError> {
        self.guard(Permission::Edit)?;
        let Some(shape) = self.store.raised(key) else {
            return Ok(false);
        };
        self.put_shape(shape)?;
        Ok(true)
    }

    /// Lower a shape beneath all others. Returns `false` when it is absent.
    ///
    /// # Errors
    ///
    /// Same as [`RoomSession::put_shape`].
    pub fn send_to_back(&mut self, key: &str) -> Result<bool, ClientError> {
        self.guard(Permission::Edit)?;
        let Some(shape) = self.store.lowered(key) else {
            return Ok(false);
        };
        self.put_shape(shape)?;
        Ok(true)
    }

    /// Replace our presence record. Sent now or when the throttle window
    /// closes; a full queue drops the update.
    ///
    /// # Errors
    ///
    /// `NotSynced`, `Forbidden(View)`, or `Invalid` for an oversized record.
    pub fn update_presence(&mut self, presence: Presence) -> Result<(), ClientError> {
        self.guard(Permission::View)?;
        presence.validate().map_err(ClientError::Invalid)?;
        if let Some(presence) = self.presence.update(presence, Instant::now()) {
            self.send_presence(presence);
        }
        Ok(())
    }

    /// Show a reaction locally and send it to current peers.
    ///
    /// # Errors
    ///
    /// `NotSynced`, `Forbidden(View)`, `Invalid`, or a full/closed queue.
    pub fn react(&mut self, emoji: &str, point: Point) -> Result<(), ClientError> {
        self.send_event(BroadcastEvent::Reaction { emoji: emoji.to_owned(), point })?;
        self.presence.show_reaction(None, emoji.to_owned(), point, Instant::now());
        Ok(())
    }

    /// Send a chat line to current peers.
    ///
    /// # Errors
    ///
    /// Same as [`RoomSession::react`].
    pub fn chat(&mut self, text: &str) -> Result<(), ClientError> {
        self.send_event(BroadcastEvent::Chat { text: text.to_owned() })
    }

    fn send_event(&self, event: BroadcastEvent) -> Result<(), ClientError> {
        self.guard(Permission::View)?;
        event.validate().map_err(ClientError::Invalid)?;
        self.lease.connection().try_send(self.frame(Message::BroadcastEvent(event)))
    }

    fn send_presence(&self, presence: Presence) {
        match self.lease.connection().try_send(self.frame(Message::PresenceUpdate(presence))) {
            Ok(()) | Err(ClientError::Backpressure) => {}
            Err(e) => debug!(room_id = %self.room_id, error = %e, "session: presence not sent"),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

impl RoomSession {
    /// Wait for the next event, sending throttled presence and expiring
    /// reactions on the way. `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            self.gate.revalidate_if_stale(self.room_id);
            let deadline = [self.presence.next_flush_at(), self.presence.next_expiry_at()].into_iter().flatten().min();

            let event = tokio::select! {
                event = self.subscription.next() => self.handle(event?),
                () = sleep_until(deadline) => self.on_tick(),
            };
            if event.is_some() {
                return event;
            }
        }
    }

    /// Apply one channel event. `None` when nothing visible changed.
    pub fn handle(&mut self, event: ChannelEvent) -> Option<SessionEvent> {
        match event {
            ChannelEvent::Frame(frame) => self.apply_frame(frame),
            ChannelEvent::Status(status) => {
                self.status = status;
                if status != ConnectionStatus::Connected {
                    self.store.mark_unsynced();
                    self.presence.clear_peers();
                }
                Some(SessionEvent::Status(status))
            }
            ChannelEvent::Lagged(skipped) => {
                warn!(room_id = %self.room_id, skipped, "session: fell behind, resyncing");
                self.store.mark_unsynced();
                if let Err(e) = self.lease.connection().try_send(self.frame(Message::Join)) {
                    warn!(room_id = %self.room_id, error = %e, "session: resync request failed");
                }
                None
            }
        }
    }

    fn apply_frame(&mut self, frame: Frame) -> Option<SessionEvent> {
        if frame.room_id.is_some_and(|id| id != self.room_id) {
            return None;
        }
        let from = frame.from;
        let own = from.is_some() && from == self.subscription.connection_id();

        match frame.body {
            Message::Snapshot(snapshot) => {
                self.store.resync(snapshot.shapes);
                self.presence.reset_peers(snapshot.peers);
                self.gate.set(self.room_id, snapshot.permissions);
                Some(SessionEvent::Synced)
            }
            Message::StoragePut { key, shape } => self.apply_storage(own, key, Some(shape)),
            Message::StorageDelete { key } => self.apply_storage(own, key, None),
            Message::StorageReject { key, shape } => {
                self.store.settle(&key, shape);
                Some(SessionEvent::ShapeReverted(key))
            }
            Message::PresenceUpdate(presence) => {
                let from = from?;
                self.presence.apply_peer(from, presence);
                Some(SessionEvent::PeerUpdated(from))
            }
            Message::PresenceLeave => {
                let from = from?;
                self.presence.remove_peer(from).then_some(SessionEvent::PeerLeft(from))
            }
            Message::BroadcastEvent(BroadcastEvent::Reaction { emoji, point }) => {
                self.presence.show_reaction(from, emoji.clone(), point, Instant::now());
                Some(SessionEvent::Reaction { from, emoji })
            }
            Message::BroadcastEvent(BroadcastEvent::Chat { text }) => Some(SessionEvent::Chat(ChatLine { from, text })),
            Message::RoomDeleted => {
                info!(room_id = %self.room_id, "session: room deleted");
                self.store.mark_unsynced();
                self.presence.clear_peers();
                Some(SessionEvent::RoomDeleted)
            }
            Message::Error { code, message, .. } => {
                // A denial means our cached permissions are out of date.
                if code == "E_FORBIDDEN" || code == "E_UNAUTHORIZED" {
                    self.gate.invalidate(self.room_id);
                }
                Some(SessionEvent::ServerError { code, message })
            }
            Message::Connected { .. } | Message::Join | Message::Leave | Message::Ack => None,
        }
    }

    fn apply_storage(&mut self, own: bool, key: String, value: Option<Shape>) -> Option<SessionEvent> {
        if !own {
            return self.store.apply_remote(&key, value).then_some(SessionEvent::ShapeChanged(key));
        }
        if self.store.settle(&key, value) {
            Some(SessionEvent::ShapeChanged(key))
        } else if self.store.has_pending(&key) {
            None
        } else {
            Some(SessionEvent::ShapeSettled(key))
        }
    }

    fn on_tick(&mut self) -> Option<SessionEvent> {
        let now = Instant::now();
        if let Some(presence) = self.presence.flush_due(now) {
            self.send_presence(presence);
        }
        (self.presence.expire_reactions(now) > 0).then_some(SessionEvent::ReactionsExpired)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
