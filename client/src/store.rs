//! Per-collection local store.
//!
//! A store holds the materialized rows of one collection and publishes
//! inferred rows to observers through a watch channel. Every change goes
//! through the same merge the server runs, so an optimistic local write and
//! the authoritative echo converge without special cases: the echo merges
//! in, stale fields lose, and observers are only notified when an inferred
//! row actually changed.

use std::collections::BTreeMap;

use lattice_engine::{infer_row, Collection, EncodedField, EncodedRow, Meta};
use serde_json::Value;
use tokio::sync::watch;

/// Observable rows of one collection.
#[derive(Debug)]
pub struct CollectionStore {
    collection: Collection,
    rows: BTreeMap<String, EncodedRow>,
    watch_tx: watch::Sender<Vec<Value>>,
}

impl CollectionStore {
    pub fn new(collection: Collection) -> Self {
        let (watch_tx, _) = watch::channel(Vec::new());
        Self {
            collection,
            rows: BTreeMap::new(),
            watch_tx,
        }
    }

    /// A new observer handle. The current rows are visible immediately.
    pub fn watch(&self) -> watch::Receiver<Vec<Value>> {
        self.watch_tx.subscribe()
    }

    /// Merge an encoded mutation into a row. Returns whether anything won.
    pub fn apply(&mut self, id: &str, payload: EncodedRow) -> bool {
        let merge = self.collection.merge_row(payload, self.rows.get(id));
        let changed = merge.accepted.is_some();
        self.rows.insert(id.to_string(), merge.materialized);
        if changed {
            self.publish();
        }
        changed
    }

    /// Merge a server snapshot by id.
    ///
    /// Snapshot rows carry no per-field metadata; they enter the merge
    /// unstamped and therefore lose to any field the client has stamped
    /// locally - an unacknowledged optimistic write survives its own
    /// snapshot.
    pub fn apply_snapshot(&mut self, rows: &[Value]) {
        let pk = self.collection.primary_field().to_string();
        for row in rows {
            let Some(obj) = row.as_object() else {
                continue;
            };
            let Some(id) = obj.get(&pk).and_then(|v| v.as_str()).map(str::to_string) else {
                continue;
            };

            let unstamped: EncodedRow = obj
                .iter()
                .map(|(name, value)| {
                    (
                        name.clone(),
                        EncodedField {
                            value: value.clone(),
                            meta: Meta::default(),
                        },
                    )
                })
                .collect();

            let merge = self.collection.merge_row(unstamped, self.rows.get(&id));
            self.rows.insert(id, merge.materialized);
        }
        self.publish();
    }

    /// The materialized row, if present.
    pub fn row(&self, id: &str) -> Option<&EncodedRow> {
        self.rows.get(id)
    }

    /// Restore a row to a previous state (optimistic rollback).
    pub fn restore(&mut self, id: &str, previous: Option<EncodedRow>) {
        match previous {
            Some(row) => {
                self.rows.insert(id.to_string(), row);
            }
            None => {
                self.rows.remove(id);
            }
        }
        self.publish();
    }

    /// Inferred rows in primary-key order.
    pub fn inferred(&self) -> Vec<Value> {
        self.rows.values().map(infer_row).collect()
    }

    fn publish(&self) {
        let next = self.inferred();
        self.watch_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
