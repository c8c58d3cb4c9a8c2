//! Server configuration loaded from the environment.
//!
//! Every knob has a default so `canvasroom` starts with no environment at
//! all (in-memory store on port 3000). `main` loads `.env` via `dotenvy`
//! before calling [`Config::from_env`].

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_SHAPE_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_PRESENCE_BURST_PER_SEC: usize = 120;
const DEFAULT_BROADCAST_EVENTS_PER_WINDOW: usize = 20;
const DEFAULT_BROADCAST_WINDOW_SECS: u64 = 10;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Postgres URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// How often dirty shapes are flushed to the store.
    pub shape_flush_interval: Duration,
    /// Hard server-side cap on presence frames per connection per second.
    pub presence_burst_per_sec: usize,
    pub broadcast_events_per_window: usize,
    pub broadcast_window: Duration,
    /// Outbound frame queue per connection.
    pub client_channel_capacity: usize,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            shape_flush_interval: Duration::from_millis(env_parse(
                "SHAPE_FLUSH_INTERVAL_MS",
                DEFAULT_SHAPE_FLUSH_INTERVAL_MS,
            )),
            presence_burst_per_sec: env_parse("PRESENCE_BURST_PER_SEC", DEFAULT_PRESENCE_BURST_PER_SEC),
            broadcast_events_per_window: env_parse("BROADCAST_EVENTS_PER_WINDOW", DEFAULT_BROADCAST_EVENTS_PER_WINDOW),
            broadcast_window: Duration::from_secs(env_parse("BROADCAST_WINDOW_SECS", DEFAULT_BROADCAST_WINDOW_SECS)),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            shape_flush_interval: Duration::from_millis(DEFAULT_SHAPE_FLUSH_INTERVAL_MS),
            presence_burst_per_sec: DEFAULT_PRESENCE_BURST_PER_SEC,
            broadcast_events_per_window: DEFAULT_BROADCAST_EVENTS_PER_WINDOW,
            broadcast_window: Duration::from_secs(DEFAULT_BROADCAST_WINDOW_SECS),
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
