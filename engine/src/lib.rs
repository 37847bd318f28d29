//! # Lattice Engine
//!
//! The deterministic core of the Lattice real-time sync runtime.
//!
//! This crate holds everything the server and client share: the schema and
//! field type algebra, the per-field last-writer-wins merge, the where/include
//! clause model, and the wire protocol types. It is the single source of
//! truth for conflict resolution: both peers merge with the same code, so
//! they converge on the same state.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of sockets, databases, or clocks;
//!   wall-clock readings enter as arguments
//! - **Deterministic**: same inputs always produce same outputs
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Fields and collections
//!
//! A [`FieldType`] describes one typed column: how raw input is normalized
//! and encoded, how concurrent writes to it merge, and how it projects to a
//! relational column. A [`Collection`] is a named map of fields plus
//! [`Relation`]s to other collections; a [`Schema`] is the validated set of
//! collections.
//!
//! ### Materialized values
//!
//! Every field persists as `{value, _meta: {timestamp}}`, an
//! [`EncodedField`]. A row is an [`EncodedRow`]. Timestamps are ISO-8601
//! millisecond strings compared lexicographically.
//!
//! ### Merge
//!
//! [`Collection::merge_row`] applies an encoded mutation per field: the
//! higher timestamp wins, ties keep the current value, and the subset that
//! won is returned as the accepted diff. Applying any permutation of the
//! same mutations yields the same materialized row.
//!
//! ### Clauses
//!
//! [`WhereClause`] and [`IncludeClause`] model the query grammar
//! (`$eq/$in/$not/$gt/$gte/$lt/$lte`, `$and`/`$or`, relation traversal).
//! They parse from JSON, validate against a schema, and evaluate in memory;
//! the storage back-end compiles the same AST to SQL.
//!
//! ## Quick Start
//!
//! ```rust
//! use lattice_engine::{
//!     collection, create_relations, create_schema, id, number, reference, string,
//!     many, one,
//! };
//! use serde_json::json;
//!
//! let users = collection("users", [("id", id()), ("name", string().nullable())]);
//! let posts = collection(
//!     "posts",
//!     [
//!         ("id", id()),
//!         ("views", number().nullable()),
//!         ("userId", reference("users", "id")),
//!     ],
//! );
//!
//! let user_rel = create_relations(&users, [("posts", many("posts", "userId"))]);
//! let post_rel = create_relations(&posts, [("user", one("users", "userId"))]);
//!
//! let schema = create_schema([users, posts], [user_rel, post_rel]).unwrap();
//!
//! let users = schema.collection("users").unwrap();
//! let first = users
//!     .encode_row(&json!({"id": "u1", "name": "Ada"}), "2026-01-01T00:00:00.000Z")
//!     .unwrap();
//! let merge = users.merge_row(first, None);
//! assert!(merge.accepted.is_some());
//! ```

pub mod clause;
pub mod clock;
pub mod error;
pub mod field;
pub mod merge;
pub mod mutation;
pub mod protocol;
pub mod schema;
pub mod value;

// Re-export main types at crate root
pub use clause::{
    extract_include_from_where, CompareOps, Direction, FieldCondition, IncludeClause, IncludeSpec,
    NotCondition, OrderBy, Query, SubQuery, WhereClause,
};
pub use clock::MonotonicClock;
pub use error::Error;
pub use field::{
    boolean, enumeration, id, json, number, reference, string, timestamp, FieldKind,
    FieldReference, FieldType, MutationKind, SqlType, StorageFieldType,
};
pub use merge::RowMerge;
pub use mutation::{Mutation, MutationEvent, Procedure};
pub use protocol::{ClientMessage, ErrorCode, ServerMessage};
pub use schema::{
    collection, create_relations, create_schema, many, one, Collection, Relation, RelationKind,
    RelationsDecl, Schema,
};
pub use value::{format_timestamp, infer_row, EncodedField, EncodedRow, Meta};

/// Type aliases for clarity
pub type CollectionName = String;
pub type RowId = String;
pub type Timestamp = String;
