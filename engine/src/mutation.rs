//! Mutation records.
//!
//! A mutation describes one accepted INSERT or UPDATE to one row. The
//! storage engine produces them on every accepted write; the sync server
//! fans them out to matching subscriptions.

use crate::value::EncodedRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The write procedure of a mutation.
///
/// `Delete` is reserved on the wire; storage rejects it in v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Procedure {
    Insert,
    Update,
    Delete,
}

/// One accepted write to one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Server-assigned mutation record id.
    pub id: String,
    /// Collection name.
    pub resource: String,
    /// Primary key of the affected row.
    pub resource_id: String,
    pub procedure: Procedure,
    /// The accepted fields with their metadata.
    pub payload: EncodedRow,
    /// Client-assigned id for ack correlation, if the write came over the
    /// protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
}

/// A committed mutation together with the post-merge row, as handed to the
/// subscriber sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    pub mutation: Mutation,
    /// Post-merge inferred row.
    pub row: Value,
    /// Connection that submitted the write, for origin suppression.
    pub origin: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EncodedField;
    use serde_json::json;

    #[test]
    fn procedure_wire_form() {
        assert_eq!(
            serde_json::to_string(&Procedure::Insert).unwrap(),
            "\"INSERT\""
        );
        assert_eq!(
            serde_json::from_str::<Procedure>("\"UPDATE\"").unwrap(),
            Procedure::Update
        );
    }

    #[test]
    fn mutation_roundtrip() {
        let mut payload = EncodedRow::new();
        payload.insert(
            "name".into(),
            EncodedField::new(json!("Ada"), "2026-01-01T00:00:00.000Z"),
        );

        let mutation = Mutation {
            id: "m1".into(),
            resource: "users".into(),
            resource_id: "u1".into(),
            procedure: Procedure::Insert,
            payload,
            mutation_id: Some("c1".into()),
        };

        let encoded = serde_json::to_value(&mutation).unwrap();
        assert_eq!(encoded["resourceId"], "u1");
        assert_eq!(encoded["mutationId"], "c1");
        assert_eq!(encoded["payload"]["name"]["value"], "Ada");

        let parsed: Mutation = serde_json::from_value(encoded).unwrap();
        assert_eq!(parsed, mutation);
    }
}
