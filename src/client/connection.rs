//! Room connections: one websocket per room, shared by every view of it.
//!
//! DESIGN
//! ======
//! A [`Connection`] is the handle side of a channel driver. Outbound frames
//! go through a bounded `mpsc` queue, inbound frames fan out on a
//! `broadcast` channel, and the link state (status plus the server-assigned
//! connection id) is a `watch` value. The [`Connector`] trait is the seam:
//! [`WsConnector`] drives a real socket, tests plug in channel doubles.
//!
//! RECONNECT
//! =========
//! When the socket drops the driver reports `Reconnecting`, waits with
//! exponential backoff and dials again. A re-established socket sends
//! `join` before anything queued, so the first reply is a full snapshot.
//! After `max_reconnect_attempts` failed dials in a row the link reports
//! `Degraded` and the driver stops.
//!
//! SHARING
//! =======
//! [`ConnectionRegistry`] reference-counts connections per room. Each
//! `open` returns a [`RoomLease`]; the socket is closed when the last
//! lease for its room is closed or dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClientConfig, ClientError, ws_url};
use crate::frame::{Frame, Message};

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 512;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect budget exhausted; the connection will not recover by itself.
    Degraded,
}

/// Current state of the socket behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub status: ConnectionStatus,
    /// Id from the server's `connected` frame. Frames whose `from` equals it
    /// are this connection's own writes echoed back.
    pub connection_id: Option<Uuid>,
}

impl Link {
    #[must_use]
    pub fn connecting() -> Self {
        Self { status: ConnectionStatus::Connecting, connection_id: None }
    }
}

/// One item read from a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(Frame),
    Status(ConnectionStatus),
    /// The subscriber fell behind and this many frames were dropped.
    Lagged(u64),
}

// =============================================================================
// CONNECTION
// =============================================================================

pub struct Connection {
    room_id: Uuid,
    outbound: mpsc::Sender<Frame>,
    inbound: broadcast::Sender<Frame>,
    link: watch::Receiver<Link>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Connection {
    /// Assemble a connection from the handle ends of a driver's channels.
    #[must_use]
    pub fn from_parts(
        room_id: Uuid,
        outbound: mpsc::Sender<Frame>,
        inbound: broadcast::Sender<Frame>,
        link: watch::Receiver<Link>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self { room_id, outbound, inbound, link, shutdown: Mutex::new(Some(shutdown)) }
    }

    #[must_use]
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    #[must_use]
    pub fn link(&self) -> Link {
        *self.link.borrow()
    }

    /// Frames and status changes from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let mut link = self.link.clone();
        link.mark_unchanged();
        Subscription { frames: self.inbound.subscribe(), link }
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// `Backpressure` when the outbound queue is full, `Closed` once the
    /// driver has stopped.
    pub fn try_send(&self, frame: Frame) -> Result<(), ClientError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
        })
    }

    /// Reserve an outbound slot so a caller can commit local state only when
    /// the frame is guaranteed to be queued.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::try_send`].
    pub fn try_reserve(&self) -> Result<mpsc::Permit<'_, Frame>, ClientError> {
        self.outbound.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => ClientError::Backpressure,
            mpsc::error::TrySendError::Closed(()) => ClientError::Closed,
        })
    }

    /// Stop the driver. Idempotent.
    pub fn close(&self) {
        let sender = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiving side of a connection for one consumer.
pub struct Subscription {
    frames: broadcast::Receiver<Frame>,
    link: watch::Receiver<Link>,
}

impl Subscription {
    /// Next frame or status change. `None` once the driver is gone.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        tokio::select! {
            biased;
            changed = self.link.changed() => match changed {
                Ok(()) => Some(ChannelEvent::Status(self.link.borrow_and_update().status)),
                Err(_) => self.drain_frames(),
            },
            frame = self.frames.recv() => match frame {
                Ok(frame) => Some(ChannelEvent::Frame(frame)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some(ChannelEvent::Lagged(skipped)),
                Err(broadcast::error::RecvError::Closed) => None,
            },
        }
    }

    /// Frames still buffered after the link sender is gone.
    fn drain_frames(&mut self) -> Option<ChannelEvent> {
        match self.frames.try_recv() {
            Ok(frame) => Some(ChannelEvent::Frame(frame)),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Some(ChannelEvent::Lagged(skipped)),
            Err(_) => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.link.borrow().status
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<Uuid> {
        self.link.borrow().connection_id
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// Opens the channel for one room.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, room_id: Uuid) -> Result<Connection, ClientError>;
}

/// Connector over a real websocket.
pub struct WsConnector {
    config: ClientConfig,
}

impl WsConnector {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, room_id: Uuid) -> Result<Connection, ClientError> {
        let url = ws_url(&self.config.base_url, &self.config.token)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let (link_tx, link_rx) = watch::channel(Link::connecting());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let driver = Driver {
            url,
            room_id,
            config: self.config.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx.clone(),
            link: link_tx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(driver.run());

        Ok(Connection::from_parts(room_id, outbound_tx, inbound_tx, link_rx, shutdown_tx))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum PumpExit {
    Stopped,
    Dropped,
}

struct Driver {
    url: String,
    room_id: Uuid,
    config: ClientConfig,
    outbound: mpsc::Receiver<Frame>,
    inbound: broadcast::Sender<Frame>,
    link: watch::Sender<Link>,
    shutdown: oneshot::Receiver<()>,
}

impl Driver {
    async fn run(mut self) {
        let room_id = self.room_id;
        let mut failures: u32 = 0;
        let mut has_connected = false;

        loop {
            let status = if has_connected || failures > 0 {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            };
            self.link.send_replace(Link { status, connection_id: None });

            let dialed = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = &mut self.shutdown => return,
            };

            match dialed {
                Ok((socket, _)) => {
                    failures = 0;
                    self.link.send_modify(|link| link.status = ConnectionStatus::Connected);
                    info!(%room_id, "client: connected");
                    let rejoin = has_connected;
                    has_connected = true;
                    match self.pump(socket, rejoin).await {
                        PumpExit::Stopped => {
                            info!(%room_id, "client: closed");
                            return;
                        }
                        PumpExit::Dropped => warn!(%room_id, "client: connection dropped"),
                    }
                }
                Err(e) => warn!(%room_id, error = %e, "client: connect failed"),
            }

            failures += 1;
            if failures > self.config.max_reconnect_attempts {
                warn!(%room_id, failures, "client: reconnect budget exhausted");
                self.link.send_modify(|link| link.status = ConnectionStatus::Degraded);
                return;
            }

            let delay = self.config.reconnect_delay(failures);
            debug!(%room_id, ?delay, failures, "client: backing off");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = &mut self.shutdown => return,
            }
        }
    }

    async fn pump(&mut self, socket: WsStream, rejoin: bool) -> PumpExit {
        let (mut sink, mut stream) = socket.split();

        // Resync before anything that queued up while we were away.
        if rejoin {
            let join = Frame::request(Message::Join).with_room_id(self.room_id);
            if send_json(&mut sink, &join).await.is_err() {
                return PumpExit::Dropped;
            }
        }

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    let _ = sink.close().await;
                    return PumpExit::Stopped;
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        let _ = sink.close().await;
                        return PumpExit::Stopped;
                    };
                    if send_json(&mut sink, &frame).await.is_err() {
                        return PumpExit::Dropped;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.deliver(text.as_str()),
                    Some(Ok(WsMessage::Close(_)) | Err(_)) | None => return PumpExit::Dropped,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "client: undecodable frame");
                return;
            }
        };
        if let Message::Connected { connection_id, .. } = frame.body {
            self.link.send_modify(|link| link.connection_id = Some(connection_id));
        }
        // No subscribers is fine: a view may be between leases.
        let _ = self.inbound.send(frame);
    }
}

async fn send_json<S>(sink: &mut S, frame: &Frame) -> Result<(), ()>
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|e| warn!(error = %e, "client: failed to serialize frame"))?;
    sink.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

// =============================================================================
// REGISTRY
// =============================================================================

struct Entry {
    connection: Arc<Connection>,
    leases: usize,
}

type Entries = Arc<Mutex<HashMap<Uuid, Entry>>>;

/// Reference-counted connections keyed by room.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    entries: Entries,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector, entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Lease the room's connection, opening it if this is the first lease.
    ///
    /// # Errors
    ///
    /// Whatever the connector returns for a fresh connection.
    pub async fn open(&self, room_id: Uuid) -> Result<RoomLease, ClientError> {
        if let Some(lease) = self.acquire_existing(room_id) {
            return Ok(lease);
        }

        let fresh = Arc::new(self.connector.connect(room_id).await?);

        let mut entries = lock(&self.entries);
        let entry = entries.entry(room_id).or_insert_with(|| Entry { connection: Arc::clone(&fresh), leases: 0 });
        entry.leases += 1;
        let connection = Arc::clone(&entry.connection);
        drop(entries);

        // Lost a race with a concurrent open: keep theirs.
        if !Arc::ptr_eq(&connection, &fresh) {
            fresh.close();
        }
        Ok(RoomLease { room_id, connection, entries: Arc::clone(&self.entries), released: false })
    }

    fn acquire_existing(&self, room_id: Uuid) -> Option<RoomLease> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(&room_id)?;
        entry.leases += 1;
        Some(RoomLease {
            room_id,
            connection: Arc::clone(&entry.connection),
            entries: Arc::clone(&self.entries),
            released: false,
        })
    }

    /// Number of live leases on a room's connection.
    #[must_use]
    pub fn lease_count(&self, room_id: Uuid) -> usize {
        lock(&self.entries).get(&room_id).map_or(0, |entry| entry.leases)
    }
}

fn lock(entries: &Entries) -> std::sync::MutexGuard<'_, HashMap<Uuid, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A view's hold on a room connection.
pub struct RoomLease {
    room_id: Uuid,
    connection: Arc<Connection>,
    entries: Entries,
    released: bool,
}

impl RoomLease {
    #[must_use]
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Give the lease back. The socket closes with the last lease.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(&self.room_id) else {
            return;
        };
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases == 0 {
            if let Some(entry) = entries.remove(&self.room_id) {
                entry.connection.close();
                debug!(room_id = %self.room_id, "client: last lease released");
            }
        }
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Server-side ends of a connection created by [`ChannelConnector`].
    pub struct FakeServer {
        pub room_id: Uuid,
        pub outbound: mpsc::Receiver<Frame>,
        pub inbound: broadcast::Sender<Frame>,
        pub link: watch::Sender<Link>,
        pub shutdown: oneshot::Receiver<()>,
    }

    impl FakeServer {
        pub fn push(&self, frame: Frame) {
            self.inbound.send(frame).unwrap();
        }

        pub fn set_status(&self, status: ConnectionStatus) {
            self.link.send_modify(|link| link.status = status);
        }

        pub async fn next_sent(&mut self) -> Frame {
            tokio::time::timeout(std::time::Duration::from_millis(200), self.outbound.recv())
                .await
                .expect("outbound receive timed out")
                .expect("outbound channel closed")
        }

        pub fn assert_nothing_sent(&mut self) {
            assert!(self.outbound.try_recv().is_err(), "expected no outbound frame");
        }
    }

    /// In-process connector. Each connect hands its server ends to the test.
    #[derive(Default)]
    pub struct ChannelConnector {
        pub connects: AtomicUsize,
        pub servers: Mutex<Vec<FakeServer>>,
    }

    impl ChannelConnector {
        pub fn take_server(&self) -> FakeServer {
            self.servers.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        async fn connect(&self, room_id: Uuid) -> Result<Connection, ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (outbound_tx, outbound_rx) = mpsc::channel(16);
            let (inbound_tx, _) = broadcast::channel(64);
            let connection_id = Uuid::new_v4();
            let (link_tx, link_rx) =
                watch::channel(Link { status: ConnectionStatus::Connected, connection_id: Some(connection_id) });
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            self.servers.lock().unwrap().push(FakeServer {
                room_id,
                outbound: outbound_rx,
                inbound: inbound_tx.clone(),
                link: link_tx,
                shutdown: shutdown_rx,
            });
            Ok(Connection::from_parts(room_id, outbound_tx, inbound_tx, link_rx, shutdown_tx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ChannelConnector;
    use super::*;
    use std::sync::atomic::Ordering;

    fn registry() -> (ConnectionRegistry, Arc<ChannelConnector>) {
        let connector = Arc::new(ChannelConnector::default());
        (ConnectionRegistry::new(connector.clone()), connector)
    }

    #[tokio::test]
    async fn leases_share_one_connection_per_room() {
        let (registry, connector) = registry();
        let room = Uuid::new_v4();

        let a = registry.open(room).await.unwrap();
        let b = registry.open(room).await.unwrap();
        let _other = registry.open(Uuid::new_v4()).await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(registry.lease_count(room), 2);
        assert!(std::ptr::eq(a.connection(), b.connection()));
    }

    #[tokio::test]
    async fn socket_closes_with_last_lease() {
        let (registry, connector) = registry();
        let room = Uuid::new_v4();
        let a = registry.open(room).await.unwrap();
        let b = registry.open(room).await.unwrap();
        let mut server = connector.take_server();

        a.close();
        assert_eq!(registry.lease_count(room), 1);
        assert!(server.shutdown.try_recv().is_err());

        drop(b);
        assert_eq!(registry.lease_count(room), 0);
        assert!(server.shutdown.try_recv().is_ok());
    }

    #[tokio::test]
    async fn reopening_after_release_dials_again() {
        let (registry, connector) = registry();
        let room = Uuid::new_v4();
        registry.open(room).await.unwrap().close();
        let _again = registry.open(room).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscription_sees_frames_and_status_changes() {
        let (registry, connector) = registry();
        let room = Uuid::new_v4();
        let lease = registry.open(room).await.unwrap();
        let server = connector.take_server();
        let mut sub = lease.connection().subscribe();

        server.set_status(ConnectionStatus::Reconnecting);
        assert_eq!(sub.next().await, Some(ChannelEvent::Status(ConnectionStatus::Reconnecting)));

        let frame = Frame::request(Message::RoomDeleted).with_room_id(room);
        server.push(frame.clone());
        assert_eq!(sub.next().await, Some(ChannelEvent::Frame(frame)));
    }

    #[tokio::test]
    async fn try_send_reports_closed_driver() {
        let (registry, connector) = registry();
        let lease = registry.open(Uuid::new_v4()).await.unwrap();
        drop(connector.take_server());
        let result = lease.connection().try_send(Frame::request(Message::Join));
        assert!(matches!(result, Err(ClientError::Closed)));
    }
}
