//! Convergence scenarios for the merge algebra.
//!
//! End-to-end merge sequences as two peers would produce them, plus boundary
//! inputs.

use lattice_engine::{
    collection, create_schema, id, number, string, EncodedRow, MonotonicClock, Schema,
};
use serde_json::json;

fn counters_schema() -> Schema {
    let counters = collection("counters", [("id", id()), ("counter", number().nullable())]);
    create_schema([counters], []).unwrap()
}

fn users_schema() -> Schema {
    let users = collection("users", [("id", id()), ("name", string().nullable())]);
    create_schema([users], []).unwrap()
}

// ============================================================================
// Concurrent writers
// ============================================================================

#[test]
fn concurrent_set_converges_to_later_writer() {
    let schema = counters_schema();
    let counters = schema.collection("counters").unwrap();

    // Client A sets counter=1 at :00, client B sets counter=2 at :01.
    let from_a = counters
        .encode_row(&json!({"id": "0", "counter": 1}), "2026-01-01T00:00:00.000Z")
        .unwrap();
    let from_b = counters
        .encode_row(&json!({"id": "0", "counter": 2}), "2026-01-01T00:00:01.000Z")
        .unwrap();

    // Server sees A then B.
    let server_ab = {
        let first = counters.merge_row(from_a.clone(), None);
        counters.merge_row(from_b.clone(), Some(&first.materialized))
    };
    // Server sees B then A.
    let server_ba = {
        let first = counters.merge_row(from_b.clone(), None);
        counters.merge_row(from_a.clone(), Some(&first.materialized))
    };

    assert_eq!(server_ab.materialized, server_ba.materialized);
    assert_eq!(server_ab.materialized["counter"].value, json!(2));

    // A's local store converges once B's accepted diff arrives.
    let mut a_local = counters.merge_row(from_a, None).materialized;
    a_local = counters
        .merge_row(from_b, Some(&a_local))
        .materialized;
    assert_eq!(a_local["counter"].value, json!(2));
}

#[test]
fn equal_timestamps_keep_current() {
    let schema = counters_schema();
    let counters = schema.collection("counters").unwrap();

    let first = counters
        .encode_row(&json!({"counter": 1}), "2026-01-01T00:00:00.000Z")
        .unwrap();
    let second = counters
        .encode_row(&json!({"counter": 2}), "2026-01-01T00:00:00.000Z")
        .unwrap();

    let merged = counters.merge_row(first.clone(), None);
    let replay = counters.merge_row(second, Some(&merged.materialized));

    assert!(replay.accepted.is_none());
    assert_eq!(replay.materialized["counter"].value, json!(1));
}

// ============================================================================
// Null overwrites
// ============================================================================

#[test]
fn later_null_overwrites_value() {
    let schema = users_schema();
    let users = schema.collection("users").unwrap();

    let insert = users
        .encode_row(
            &json!({"id": "u1", "name": "John"}),
            "2026-01-01T00:00:00.000Z",
        )
        .unwrap();
    let clear = users
        .encode_row(&json!({"name": null}), "2026-01-01T00:00:01.000Z")
        .unwrap();

    let current = users.merge_row(insert, None).materialized;
    let merged = users.merge_row(clear, Some(&current));

    assert_eq!(merged.materialized["name"].value, serde_json::Value::Null);
    assert_eq!(
        merged.materialized["name"].meta.timestamp.as_deref(),
        Some("2026-01-01T00:00:01.000Z")
    );
    // The null write is an accepted diff, not a rejection.
    assert!(merged.accepted.unwrap().contains_key("name"));
}

#[test]
fn earlier_null_loses_to_value() {
    let schema = users_schema();
    let users = schema.collection("users").unwrap();

    let named = users
        .encode_row(&json!({"name": "John"}), "2026-01-01T00:00:01.000Z")
        .unwrap();
    let clear = users
        .encode_row(&json!({"name": null}), "2026-01-01T00:00:00.000Z")
        .unwrap();

    let current = users.merge_row(named, None).materialized;
    let merged = users.merge_row(clear, Some(&current));

    assert!(merged.accepted.is_none());
    assert_eq!(merged.materialized["name"].value, json!("John"));
}

// ============================================================================
// Boundary inputs
// ============================================================================

#[test]
fn empty_and_unicode_strings() {
    let schema = users_schema();
    let users = schema.collection("users").unwrap();

    let names = ["", "日本語テスト", "Привет мир", "🎉🚀", "Hello\nWorld\tTab"];
    let mut current: Option<EncodedRow> = None;

    for (i, name) in names.iter().enumerate() {
        let stamp = format!("2026-01-01T00:00:0{i}.000Z");
        let mutation = users.encode_row(&json!({"name": name}), &stamp).unwrap();
        let merged = users.merge_row(mutation, current.as_ref());
        assert_eq!(merged.materialized["name"].value, json!(name));
        current = Some(merged.materialized);
    }
}

#[test]
fn partial_rows_merge_field_wise() {
    let schema = users_schema();
    let users = schema.collection("users").unwrap();

    let base = users
        .encode_row(
            &json!({"id": "u1", "name": "Ada"}),
            "2026-01-01T00:00:00.000Z",
        )
        .unwrap();
    let partial = users
        .encode_row(&json!({"name": "Ada Lovelace"}), "2026-01-01T00:00:01.000Z")
        .unwrap();

    let current = users.merge_row(base, None).materialized;
    let merged = users.merge_row(partial, Some(&current)).materialized;

    // Untouched fields keep their original stamps.
    assert_eq!(
        merged["id"].meta.timestamp.as_deref(),
        Some("2026-01-01T00:00:00.000Z")
    );
    assert_eq!(merged["name"].value, json!("Ada Lovelace"));
}

// ============================================================================
// Client clock behavior
// ============================================================================

#[test]
fn monotonic_clock_never_ties_with_itself() {
    let mut clock = MonotonicClock::new();
    let frozen = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00.000Z")
        .unwrap()
        .with_timezone(&chrono::Utc);

    let schema = counters_schema();
    let counters = schema.collection("counters").unwrap();

    // Two writes issued during the same wall-clock millisecond still win in
    // issue order.
    let first = counters
        .encode_row(&json!({"counter": 1}), &clock.stamp(frozen))
        .unwrap();
    let second = counters
        .encode_row(&json!({"counter": 2}), &clock.stamp(frozen))
        .unwrap();

    let current = counters.merge_row(first, None).materialized;
    let merged = counters.merge_row(second, Some(&current));

    assert!(merged.accepted.is_some());
    assert_eq!(merged.materialized["counter"].value, json!(2));
}
