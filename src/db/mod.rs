//! Backing store for rooms, workspace membership, sessions and shapes.
//!
//! SYSTEM CONTEXT
//! ==============
//! Services talk to the store only through [`RoomStore`]. Production uses
//! [`PgRoomStore`] (Postgres via SQLx, migrations run at startup). When no
//! `DATABASE_URL` is configured, and in tests, [`MemoryRoomStore`] keeps the
//! same contract in process.
//!
//! Every room write is a single-record operation; the store guarantees
//! per-record atomicity and nothing more.

mod memory;
mod postgres;

use std::collections::HashMap;
use std::fmt::Write;

use async_trait::async_trait;
use rand::Rng;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::model::{Room, Shape, WorkspaceRole};

pub use memory::MemoryRoomStore;
pub use postgres::PgRoomStore;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        "E_STORE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

// =============================================================================
// STORE TRAIT
// =============================================================================

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Resolve a session token to its user. `None` if unknown or expired.
    async fn user_for_session(&self, token: &str) -> Result<Option<Uuid>, StoreError>;

    /// Membership role of `user_id` in `workspace_id`, `None` for non-members.
    async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<WorkspaceRole>, StoreError>;

    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError>;

    /// Rooms of a workspace, newest first.
    async fn list_rooms(&self, workspace_id: Uuid) -> Result<Vec<Room>, StoreError>;

    async fn insert_room(&self, room: &Room) -> Result<(), StoreError>;

    /// Replace a room record. Returns `false` if the room no longer exists.
    async fn update_room(&self, room: &Room) -> Result<bool, StoreError>;

    /// Remove a room and its shapes. Returns `false` if it did not exist.
    async fn delete_room(&self, room_id: Uuid) -> Result<bool, StoreError>;

    async fn load_shapes(&self, room_id: Uuid) -> Result<HashMap<String, Shape>, StoreError>;

    /// Upsert shapes by key. Writes for a room that no longer exists are dropped.
    async fn upsert_shapes(&self, room_id: Uuid, shapes: &[Shape]) -> Result<(), StoreError>;

    async fn delete_shapes(&self, room_id: Uuid, keys: &[String]) -> Result<(), StoreError>;
}

// =============================================================================
// POOL
// =============================================================================

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

// =============================================================================
// TOKENS
// =============================================================================

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a random 32-byte hex session token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}
