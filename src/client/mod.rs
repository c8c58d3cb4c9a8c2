//! Native async client for a canvas room.
//!
//! ARCHITECTURE
//! ============
//! A room view is one [`RoomSession`]. It leases a shared websocket from the
//! [`ConnectionRegistry`], asks the [`PermissionGate`] before every mutation,
//! and keeps a [`LocalShapeStore`] plus a [`PresenceState`] in step with the
//! frames the server fans out.
//!
//! DESIGN
//! ======
//! - The gate is advisory. The server re-checks every write and answers a
//!   denial with `storage-reject`, which the local store applies as a revert.
//! - The store is unavailable (`is_synced() == false`) until a `snapshot`
//!   arrives, and again from the moment the socket drops until the resync.
//! - Nothing here is replayed after a reconnect: the connector re-sends
//!   `join` and the reply replaces local state wholesale.

pub mod connection;
pub mod gate;
pub mod presence;
pub mod session;
pub mod store;

use std::time::Duration;

pub use connection::{
    ChannelEvent, Connection, ConnectionRegistry, ConnectionStatus, Connector, Link, RoomLease, Subscription,
    WsConnector,
};
pub use gate::{GateState, HttpPermissionSource, PermissionGate, PermissionSource};
pub use presence::{DisplayedReaction, PresenceState};
pub use session::{ChatLine, RoomSession, SessionEvent};
pub use store::LocalShapeStore;

use crate::config::env_parse;
use crate::services::permission::Permission;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_PERMISSION_TTL_SECS: u64 = 30;
const DEFAULT_PRESENCE_INTERVAL_MS: u64 = 16;
const DEFAULT_REACTION_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 8;

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL of the server, e.g. `http://127.0.0.1:3000`.
    pub base_url: String,
    /// Session token sent as `Bearer` over HTTP and `?token=` on upgrade.
    pub token: String,
    /// How long a fetched permission set is trusted before revalidation.
    pub permission_ttl: Duration,
    /// Minimum spacing between outgoing presence updates.
    pub presence_interval: Duration,
    /// How long a received reaction stays on screen.
    pub reaction_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Failed connects in a row before the connection reports `Degraded`.
    pub max_reconnect_attempts: u32,
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            permission_ttl: Duration::from_secs(DEFAULT_PERMISSION_TTL_SECS),
            presence_interval: Duration::from_millis(DEFAULT_PRESENCE_INTERVAL_MS),
            reaction_timeout: Duration::from_millis(DEFAULT_REACTION_TIMEOUT_MS),
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }

    /// Load from `CANVASROOM_URL`, `CANVASROOM_TOKEN` and the optional
    /// `CANVASROOM_*` tuning variables.
    #[must_use]
    pub fn from_env() -> Self {
        let base_url = std::env::var("CANVASROOM_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());
        let token = std::env::var("CANVASROOM_TOKEN").unwrap_or_default();
        Self {
            permission_ttl: Duration::from_secs(env_parse("CANVASROOM_PERMISSION_TTL_SECS", DEFAULT_PERMISSION_TTL_SECS)),
            presence_interval: Duration::from_millis(env_parse(
                "CANVASROOM_PRESENCE_INTERVAL_MS",
                DEFAULT_PRESENCE_INTERVAL_MS,
            )),
            reaction_timeout: Duration::from_millis(env_parse(
                "CANVASROOM_REACTION_TIMEOUT_MS",
                DEFAULT_REACTION_TIMEOUT_MS,
            )),
            max_reconnect_attempts: env_parse("CANVASROOM_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
            ..Self::new(base_url, token)
        }
    }

    /// Delay before reconnect attempt `failures` (1-based): the base doubled
    /// per failure, capped at `reconnect_max`.
    #[must_use]
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.reconnect_base.saturating_mul(1 << exponent).min(self.reconnect_max)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Backpressure,
    #[error("room is still syncing")]
    NotSynced,
    #[error("missing permission: {}", .0.as_str())]
    Forbidden(Permission),
    #[error("invalid shape: {0}")]
    Invalid(String),
}

/// `ws(s)://host/ws?token=...` for an `http(s)://host` base URL.
pub(crate) fn ws_url(base_url: &str, token: &str) -> Result<String, ClientError> {
    let trimmed = base_url.trim_end_matches('/');

    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/ws?token={token}"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/ws?token={token}"));
    }

    Err(ClientError::InvalidBaseUrl(base_url.to_owned()))
}
