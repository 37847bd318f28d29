//! Error types for the Lattice engine.

use thiserror::Error;

/// All possible errors from the Lattice engine.
///
/// Losing a last-writer-wins comparison is *not* an error; merges report a
/// rejected field by omitting it from the accepted diff.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema build errors
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("duplicate collection: {0}")]
    DuplicateCollection(String),

    #[error("relation '{relation}' on '{collection}' targets unknown collection '{target}'")]
    UnknownRelationTarget {
        collection: String,
        relation: String,
        target: String,
    },

    #[error("relation '{relation}' on '{collection}' names unknown column '{column}'")]
    UnknownRelationColumn {
        collection: String,
        relation: String,
        column: String,
    },

    #[error("field '{field}' on '{collection}' references unknown target '{target}'")]
    BrokenReference {
        collection: String,
        field: String,
        target: String,
    },

    #[error("collection '{collection}' must have exactly one primary field, found {count}")]
    PrimaryKeyCount { collection: String, count: usize },

    // Mutation encoding errors
    #[error("unsupported mutation: {0}")]
    UnsupportedMutation(String),

    #[error("invalid value for field '{field}': expected {expected}, got {got}")]
    InvalidValue {
        field: String,
        expected: String,
        got: String,
    },

    #[error("value '{value}' is not a member of enum field '{field}'")]
    UnknownEnumValue { field: String, value: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Clause errors
    #[error("unknown field '{field}' on collection '{collection}'")]
    UnknownField { collection: String, field: String },

    #[error("operator '{operator}' is not valid on field '{field}': {reason}")]
    InvalidOperator {
        field: String,
        operator: String,
        reason: String,
    },

    #[error("invalid clause: {0}")]
    InvalidClause(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
