//! Performance benchmarks for lattice-engine

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lattice_engine::{collection, create_schema, id, number, string, EncodedRow, Schema};
use serde_json::json;

fn create_test_schema() -> Schema {
    let users = collection(
        "users",
        [
            ("id", id()),
            ("name", string().nullable()),
            ("email", string().nullable()),
            ("age", number().nullable()),
        ],
    );
    create_schema([users], []).unwrap()
}

fn ts(millis: i64) -> String {
    lattice_engine::format_timestamp(
        chrono::DateTime::from_timestamp_millis(millis).expect("valid millis"),
    )
}

fn bench_merge_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_operations");

    group.bench_function("encode_row", |b| {
        let schema = create_test_schema();
        let users = schema.collection("users").unwrap();
        let stamp = ts(1_000);

        b.iter(|| {
            users.encode_row(
                black_box(&json!({"id": "u1", "name": "Ada", "age": 36})),
                black_box(&stamp),
            )
        })
    });

    group.bench_function("merge_row_fresh", |b| {
        let schema = create_test_schema();
        let users = schema.collection("users").unwrap();
        let encoded = users
            .encode_row(&json!({"id": "u1", "name": "Ada", "age": 36}), &ts(1_000))
            .unwrap();

        b.iter(|| users.merge_row(black_box(encoded.clone()), None))
    });

    group.bench_function("merge_row_against_current", |b| {
        let schema = create_test_schema();
        let users = schema.collection("users").unwrap();

        let current: EncodedRow = users
            .encode_row(&json!({"id": "u1", "name": "Ada", "age": 36}), &ts(1_000))
            .unwrap();
        let incoming = users
            .encode_row(&json!({"name": "Al", "age": 37}), &ts(2_000))
            .unwrap();

        b.iter(|| users.merge_row(black_box(incoming.clone()), Some(black_box(&current))))
    });

    group.bench_function("merge_chain_1000", |b| {
        let schema = create_test_schema();
        let users = schema.collection("users").unwrap();

        let mutations: Vec<EncodedRow> = (0..1000)
            .map(|i| {
                users
                    .encode_row(&json!({"age": i}), &ts(1_000 + i))
                    .unwrap()
            })
            .collect();

        b.iter(|| {
            let mut current: Option<EncodedRow> = None;
            for mutation in &mutations {
                let merge = users.merge_row(mutation.clone(), current.as_ref());
                current = Some(merge.materialized);
            }
            current
        })
    });

    group.finish();
}

criterion_group!(benches, bench_merge_operations);
criterion_main!(benches);
