//! Property-based tests for the merge algebra.
//!
//! These pin down the convergence guarantees: permutation determinism,
//! idempotence, convert round-trips, and timestamp monotonicity.

use lattice_engine::{
    collection, create_schema, id, number, string, timestamp, Collection, EncodedRow,
    MutationKind, Schema,
};
use proptest::prelude::*;
use serde_json::json;

fn test_schema() -> Schema {
    let items = collection(
        "items",
        [
            ("id", id()),
            ("name", string().nullable()),
            ("count", number().nullable()),
        ],
    );
    create_schema([items], []).unwrap()
}

fn ts(offset_millis: u32) -> String {
    lattice_engine::format_timestamp(
        chrono::DateTime::from_timestamp_millis(1_767_225_600_000 + offset_millis as i64)
            .expect("valid millis"),
    )
}

fn apply_in_order(items: &Collection, mutations: &[EncodedRow], order: &[usize]) -> EncodedRow {
    let mut current: Option<EncodedRow> = None;
    for &index in order {
        let merge = items.merge_row(mutations[index].clone(), current.as_ref());
        current = Some(merge.materialized);
    }
    current.unwrap_or_default()
}

proptest! {
    /// P1: applying any permutation of the same mutations (pairwise distinct
    /// timestamps) yields the same materialized value, and the survivor is
    /// the mutation with the highest timestamp.
    #[test]
    fn permutation_determinism(
        offsets in proptest::collection::btree_set(0u32..1_000_000, 1..10),
        values in proptest::collection::vec(any::<i32>(), 10),
        rotation in any::<usize>(),
    ) {
        let schema = test_schema();
        let items = schema.collection("items").unwrap();

        let offsets: Vec<u32> = offsets.into_iter().collect();
        let mutations: Vec<EncodedRow> = offsets
            .iter()
            .zip(values.iter())
            .map(|(offset, value)| {
                items
                    .encode_row(&json!({"count": value}), &ts(*offset))
                    .unwrap()
            })
            .collect();
        let n = mutations.len();

        let forward: Vec<usize> = (0..n).collect();
        let backward: Vec<usize> = (0..n).rev().collect();
        let rotated: Vec<usize> = (0..n).map(|i| (i + rotation % n.max(1)) % n).collect();

        let a = apply_in_order(items, &mutations, &forward);
        let b = apply_in_order(items, &mutations, &backward);
        let c = apply_in_order(items, &mutations, &rotated);

        prop_assert_eq!(&a, &b);
        prop_assert_eq!(&b, &c);

        // The field carries the value of the highest-timestamp mutation.
        let winner = offsets.iter().position(|o| Some(o) == offsets.iter().max());
        if let Some(winner) = winner {
            let expected = &mutations[winner]["count"];
            prop_assert_eq!(&a["count"], expected);
        }
    }

    /// P2: applying the same encoded mutation twice is equivalent to
    /// applying it once, and the replay is rejected.
    #[test]
    fn idempotence(offset in 0u32..1_000_000, value in any::<i32>()) {
        let schema = test_schema();
        let items = schema.collection("items").unwrap();

        let mutation = items
            .encode_row(&json!({"id": "i1", "count": value}), &ts(offset))
            .unwrap();

        let once = items.merge_row(mutation.clone(), None);
        let twice = items.merge_row(mutation, Some(&once.materialized));

        prop_assert_eq!(&once.materialized, &twice.materialized);
        prop_assert!(twice.accepted.is_none());
    }

    /// P3: the number convert-hook round-trips numeric strings.
    #[test]
    fn number_convert_roundtrip(value in any::<i32>(), offset in 0u32..1_000_000) {
        let field = number();
        let encoded = field
            .encode_mutation(MutationKind::Set, "count", json!(value.to_string()), &ts(offset))
            .unwrap();
        prop_assert_eq!(encoded.value.as_f64(), Some(value as f64));
        let expected_ts = ts(offset);
        prop_assert_eq!(encoded.meta.timestamp.as_deref(), Some(expected_ts.as_str()));
    }

    /// P3: the timestamp convert-hook normalizes epoch millis to the
    /// canonical ISO form.
    #[test]
    fn timestamp_convert_roundtrip(millis in 0i64..4_102_444_800_000) {
        let field = timestamp();
        let encoded = field
            .encode_mutation(MutationKind::Set, "at", json!(millis), &ts(0))
            .unwrap();
        let normalized = encoded.value.as_str().unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(normalized).unwrap();
        prop_assert_eq!(parsed.timestamp_millis(), millis);
    }

    /// P4: the materialized timestamp for a field is non-decreasing across
    /// any sequence of merges.
    #[test]
    fn merge_monotonicity(
        offsets in proptest::collection::vec(0u32..1_000_000, 1..20),
    ) {
        let schema = test_schema();
        let items = schema.collection("items").unwrap();

        let mut current: Option<EncodedRow> = None;
        let mut last_stamp: Option<String> = None;

        for (i, offset) in offsets.iter().enumerate() {
            let mutation = items
                .encode_row(&json!({"count": i}), &ts(*offset))
                .unwrap();
            let merge = items.merge_row(mutation, current.as_ref());

            let stamp = merge.materialized["count"]
                .meta
                .timestamp
                .clone()
                .expect("merged field carries a stamp");
            if let Some(previous) = &last_stamp {
                prop_assert!(stamp.as_str() >= previous.as_str());
            }
            last_stamp = Some(stamp);
            current = Some(merge.materialized);
        }
    }
}
