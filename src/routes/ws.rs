//! WebSocket handler: the realtime channel for one room per connection.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection id and enters a `select!` loop:
//! - Incoming client frames: parse, validate, dispatch by message type
//! - Frames from room peers: forward to the client
//!
//! Handler functions validate, mutate state through the services, and
//! return an `Outcome`. The dispatch layer owns all outbound concerns:
//! reply to sender and broadcast to peers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade (`?token=` session) → send `connected`
//! 2. `join` → reply with `snapshot`; joining another room parts the first
//! 3. Writes are re-authorized per frame; accepted writes echo to every
//!    member (writer included), denials revert via `storage-reject`
//! 4. Close → `part_room` (peers get `presence-leave`)
//! 5. A connection whose queue overflows on a storage write is dropped by
//!    the room and the socket is closed, forcing reconnect and resync

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Frame, Message, Status};
use crate::model::Shape;
use crate::routes::auth::resolve_token;
use crate::services::{channel, shapes};
use crate::state::{AppState, Outbox};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide what the sender receives. Room fan-out happens in the services.
#[derive(Debug)]
enum Outcome {
    /// Send done+payload to sender only.
    Reply(Message),
    /// Send empty done to sender only.
    Done,
    /// Send nothing. Used for presence, which is never acknowledged.
    Silent,
    /// Error reply plus the authoritative value the sender must restore.
    Revert { error: Frame, key: String, shape: Option<Shape> },
}

/// Per-connection state owned by the socket loop.
pub(crate) struct WsSession {
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub outbox: Outbox,
    /// Room this connection has joined, if any.
    pub room_id: Option<Uuid>,
}

// =============================================================================
// UPGRADE
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn handle_ws(State(state): State<AppState>, Query(params): Query<WsQuery>, ws: WebSocketUpgrade) -> Response {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        return (StatusCode::UNAUTHORIZED, "token required").into_response();
    };
    let user_id = match resolve_token(&state, &token).await {
        Ok(user_id) => user_id,
        Err(status) => return (status, "invalid session").into_response(),
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: Uuid) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving frames from room peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);
    let outbox = Outbox::new(client_tx);
    let evicted = outbox.evicted.clone();
    let mut session = WsSession { client_id, user_id, outbox, room_id: None };

    let welcome = Frame::request(Message::Connected { connection_id: client_id, user_id });
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }
    info!(%client_id, %user_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    WsMessage::Text(text) => {
                        for frame in process_inbound_text(&state, &mut session, text.as_str()).await {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if frame.body == Message::RoomDeleted && frame.room_id == session.room_id {
                    session.room_id = None;
                }
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            () = evicted.notified() => {
                // The room dropped us mid-stream; the client's next join resyncs.
                warn!(%client_id, "ws: fell behind room traffic; closing");
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    if let Some(room_id) = session.room_id.take() {
        channel::part_room(&state, room_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

fn malformed(message: String) -> Frame {
    let mut frame = Frame::request(Message::Error { code: "E_MALFORMED".into(), message, retryable: false });
    frame.status = Status::Error;
    frame
}

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch end-to-end.
pub(crate) async fn process_inbound_text(state: &AppState, session: &mut WsSession, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %session.client_id, error = %e, "ws: invalid inbound frame");
            return vec![malformed(format!("invalid frame: {e}"))];
        }
    };
    if req.status != Status::Request {
        return vec![req.error("E_MALFORMED", "clients may only send request frames")];
    }

    // Stamp the connection as origin; never trust a client-supplied `from`.
    req.from = Some(session.client_id);

    if !req.body.is_presence() {
        info!(client_id = %session.client_id, id = %req.id, kind = req.body.kind(), "ws: recv frame");
    }

    let result = match &req.body {
        Message::Join => handle_join(state, session, &req).await,
        Message::Leave => Ok(handle_leave(state, session, &req).await),
        Message::PresenceUpdate(_)
        | Message::StoragePut { .. }
        | Message::StorageDelete { .. }
        | Message::BroadcastEvent(_) => match joined_room(session, &req) {
            Ok(room_id) => handle_room_message(state, session, room_id, &req).await,
            Err(err) => Err(err),
        },
        other => Err(req.error("E_MALFORMED", format!("unexpected message type: {}", other.kind()))),
    };

    // Apply outcome; the dispatch layer owns all outbound logic.
    match result {
        Ok(Outcome::Reply(body)) => vec![req.done_with(body)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Ok(Outcome::Revert { error, key, shape }) => {
            let mut reject = Frame::request(Message::StorageReject { key, shape });
            reject.parent_id = Some(req.id);
            reject.room_id = req.room_id.or(session.room_id);
            vec![error, reject]
        }
        Err(err_frame) => vec![err_frame],
    }
}

/// Room the frame addresses, which must be the joined room.
fn joined_room(session: &WsSession, req: &Frame) -> Result<Uuid, Frame> {
    match (session.room_id, req.room_id) {
        (Some(joined), None) => Ok(joined),
        (Some(joined), Some(addressed)) if joined == addressed => Ok(joined),
        (_, addressed) => {
            let room = addressed.map_or_else(|| "-".to_owned(), |id| id.to_string());
            Err(req.error("E_NOT_JOINED", format!("not joined to room {room}")))
        }
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn handle_join(state: &AppState, session: &mut WsSession, req: &Frame) -> Result<Outcome, Frame> {
    let Some(room_id) = req.room_id else {
        return Err(req.error("E_VALIDATION", "roomId required"));
    };

    // Part the current room if switching.
    if let Some(old_room) = session.room_id
        && old_room != room_id
    {
        channel::part_room(state, old_room, session.client_id).await;
        session.room_id = None;
    }

    match channel::join_room(state, room_id, session.user_id, session.client_id, session.outbox.clone()).await {
        Ok(snapshot) => {
            session.room_id = Some(room_id);
            Ok(Outcome::Reply(Message::Snapshot(snapshot)))
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_leave(state: &AppState, session: &mut WsSession, req: &Frame) -> Outcome {
    if let Some(room_id) = session.room_id
        && req.room_id.is_none_or(|addressed| addressed == room_id)
    {
        channel::part_room(state, room_id, session.client_id).await;
        session.room_id = None;
    }
    Outcome::Done
}

async fn handle_room_message(
    state: &AppState,
    session: &WsSession,
    room_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match &req.body {
        Message::PresenceUpdate(presence) => {
            match channel::set_presence(state, room_id, session.client_id, presence.clone()).await {
                Ok(_) => Ok(Outcome::Silent),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        Message::StoragePut { key, shape } => {
            match shapes::put_shape(state, room_id, session.user_id, session.client_id, key, shape.clone()).await {
                Ok(_) => Ok(Outcome::Done),
                Err(e) => Ok(Outcome::Revert {
                    error: req.error_from(&e),
                    key: key.clone(),
                    shape: shapes::current_shape(state, room_id, key).await,
                }),
            }
        }
        Message::StorageDelete { key } => {
            match shapes::delete_shape(state, room_id, session.user_id, session.client_id, key).await {
                Ok(_) => Ok(Outcome::Done),
                Err(e) => Ok(Outcome::Revert {
                    error: req.error_from(&e),
                    key: key.clone(),
                    shape: shapes::current_shape(state, room_id, key).await,
                }),
            }
        }
        Message::BroadcastEvent(event) => {
            match channel::broadcast_event(state, room_id, session.client_id, event.clone()).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        other => Err(req.error("E_MALFORMED", format!("unexpected message type: {}", other.kind()))),
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if !frame.body.is_presence() {
        if let Message::Error { code, message, .. } = &frame.body {
            warn!(id = %frame.id, code = %code, message = %message, "ws: send error frame");
        } else {
            info!(id = %frame.id, kind = frame.body.kind(), status = ?frame.status, "ws: send frame");
        }
    }
    socket.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
