//! Database module for PostgreSQL persistence.

mod pool;

pub use pool::*;
