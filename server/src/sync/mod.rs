//! Real-time sync over WebSocket.
//!
//! Connections register with the [`ConnectionManager`], subscriptions live
//! in the copy-on-write [`SubscriptionRegistry`], and the [`SyncServer`]
//! dispatches protocol messages and fans committed mutations out to
//! matching subscribers.

mod connection;
mod registry;
mod server;
mod socket;

pub use connection::{ConnectionManager, MessageSender};
pub use registry::{Subscription, SubscriptionIndex, SubscriptionRegistry};
pub use server::SyncServer;
pub use socket::handle_socket;
