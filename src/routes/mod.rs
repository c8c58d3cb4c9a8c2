//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the room directory HTTP endpoints and the realtime
//! websocket under a single Axum router. Every route except `/healthz`
//! requires an authenticated session.

pub mod auth;
pub mod rooms;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route(
            "/rooms/{room_id}",
            get(rooms::get_room)
                .patch(rooms::update_room)
                .delete(rooms::delete_room),
        )
        .route("/rooms/{room_id}/permissions", get(rooms::get_permissions))
        .route("/rooms/{room_id}/collaborators", post(rooms::add_collaborator))
        .route("/rooms/{room_id}/collaborators/{user_id}", delete(rooms::remove_collaborator))
        .route("/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
