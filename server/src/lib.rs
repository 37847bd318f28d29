//! Lattice sync server.
//!
//! Projects a [`lattice_engine::Schema`] into PostgreSQL, serves relational
//! queries with nested includes, and keeps every subscribed client
//! consistent through LWW merge and mutation fan-out over WebSocket.

pub mod config;
pub mod router;
pub mod routes;
pub mod storage;
pub mod sync;

pub mod db;

use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub sync: Arc<sync::SyncServer>,
}
