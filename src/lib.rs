//! Canvas rooms: permission resolution, room directory, and the realtime
//! channel that keeps a room's shapes and presence converged.
//!
//! The server side is `routes` over `services` over `db`. The native client
//! side is `client`. Both speak the `frame` protocol and share `model`.

pub mod client;
pub mod config;
pub mod db;
pub mod frame;
pub mod model;
pub mod rate_limit;
pub mod routes;
pub mod services;
pub mod state;
