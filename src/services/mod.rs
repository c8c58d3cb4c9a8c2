//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own permission checks and state changes so route
//! handlers can stay focused on protocol translation and auth plumbing.

pub mod channel;
pub mod permission;
pub mod persistence;
pub mod room;
pub mod shapes;
