//! Row-level encode and merge.
//!
//! A collection merge recurses per field: known fields go through the field
//! type's merge, unknown fields pass through as opaque values (so peers
//! running a newer schema keep working), relation names are never writable.

use crate::error::{Error, Result};
use crate::field::MutationKind;
use crate::schema::Collection;
use crate::value::{EncodedField, EncodedRow};
use serde_json::Value;

/// Outcome of merging one encoded row into the current materialized row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMerge {
    /// The new materialized row.
    pub materialized: EncodedRow,
    /// The accepted diff: the subset of the incoming mutation that won,
    /// `None` if every field lost.
    pub accepted: Option<EncodedRow>,
    /// Incoming keys that were neither fields nor relations and passed
    /// through as opaque values. Callers may surface these.
    pub passed_through: Vec<String>,
}

impl Collection {
    /// Encode a user-visible partial row, stamping every present field at
    /// `ts`.
    ///
    /// Unknown keys encode as opaque values; relation names are rejected:
    /// set-valued writes are not part of the mutation grammar, the FK column
    /// carries to-one links instead.
    pub fn encode_row(&self, input: &Value, ts: &str) -> Result<EncodedRow> {
        let obj = input
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("row payload must be an object".into()))?;

        let mut encoded = EncodedRow::new();
        for (key, value) in obj {
            if let Some(field) = self.field(key) {
                encoded.insert(
                    key.clone(),
                    field.encode_mutation(MutationKind::Set, key, value.clone(), ts)?,
                );
            } else if self.relation(key).is_some() {
                return Err(Error::UnsupportedMutation(format!(
                    "relation '{}' on '{}' cannot be written directly",
                    key, self.name
                )));
            } else {
                encoded.insert(key.clone(), EncodedField::new(value.clone(), ts));
            }
        }
        Ok(encoded)
    }

    /// Merge an encoded row against the current materialized row.
    ///
    /// Pure and total: per-field last-writer-wins for known fields, the same
    /// timestamp rule for opaque unknown fields, relation keys skipped.
    pub fn merge_row(&self, encoded: EncodedRow, current: Option<&EncodedRow>) -> RowMerge {
        let mut materialized = current.cloned().unwrap_or_default();
        let mut accepted = EncodedRow::new();
        let mut passed_through = Vec::new();

        for (key, incoming) in encoded {
            if self.relation(&key).is_some() {
                continue;
            }

            if let Some(field) = self.field(&key) {
                let (merged, won) =
                    field.merge_mutation(MutationKind::Set, incoming, materialized.get(&key));
                materialized.insert(key.clone(), merged);
                if let Some(diff) = won {
                    accepted.insert(key, diff);
                }
                continue;
            }

            // Unknown field: opaque pass-through under the same LWW rule.
            let wins = materialized
                .get(&key)
                .map(|cur| !cur.meta.at_least(&incoming.meta))
                .unwrap_or(true);
            if wins {
                materialized.insert(key.clone(), incoming.clone());
                accepted.insert(key.clone(), incoming);
            }
            passed_through.push(key);
        }

        RowMerge {
            materialized,
            accepted: if accepted.is_empty() {
                None
            } else {
                Some(accepted)
            },
            passed_through,
        }
    }
}
