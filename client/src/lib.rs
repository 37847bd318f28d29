//! # Lattice Client
//!
//! Sync client for the Lattice runtime: per-collection local stores with
//! optimistic writes, a supervised WebSocket connection, and reactive
//! observers.
//!
//! ## How it works
//!
//! - Writes apply to the local store immediately and queue for the server;
//!   the ack merges the authoritative result back in, a rejection reverts
//!   the optimistic application and surfaces a typed error.
//! - Subscriptions register lazily and are re-established on reconnect;
//!   snapshots merge by id, broadcasts merge per field through the same
//!   last-writer-wins code the server runs.
//! - Observers are watch channels that only fire when a row's materialized
//!   value actually changed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lattice_client::{ClientConfig, LatticeClient};
//! use lattice_engine::{collection, create_schema, id, number};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = create_schema(
//!     [collection("counters", [("id", id()), ("counter", number().nullable())])],
//!     [],
//! )?;
//!
//! let client = LatticeClient::connect(
//!     ClientConfig::new("ws://localhost:3000/sync/ws"),
//!     schema,
//! );
//!
//! let counters = client.collection("counters")?;
//! let mut rows = counters.subscribe(None)?;
//!
//! counters.insert(json!({"id": "0", "counter": 1})).await?;
//!
//! rows.changed().await?;
//! println!("{:?}", *rows.borrow());
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
mod store;

pub use client::{ClientConfig, CollectionHandle, LatticeClient};
pub use error::{ClientError, Result};
pub use store::CollectionStore;
