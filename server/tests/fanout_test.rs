//! Fan-out fidelity at the registry level.
//!
//! For any accepted mutation, every subscription whose predicate matches
//! the post-merge row receives exactly one MUTATE, and the originating
//! connection receives none (it already got the ack).
//!
//! These tests exercise the in-memory predicate path; relation-traversing
//! predicates re-evaluate against storage and are covered by the query
//! compiler tests.

use lattice_engine::{
    collection, create_schema, id, number, string, EncodedField, EncodedRow, Mutation,
    MutationEvent, Procedure, Query, Schema, ServerMessage,
};
use lattice_server::router::ResourceRouter;
use lattice_server::storage::Storage;
use lattice_server::sync::{Subscription, SyncServer};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

fn counters_schema() -> Schema {
    create_schema(
        [
            collection(
                "counters",
                [("id", id()), ("counter", number().nullable())],
            ),
            collection("users", [("id", id()), ("name", string().nullable())]),
        ],
        [],
    )
    .unwrap()
}

/// A server whose storage never touches the database: the pool is lazy and
/// these tests only exercise in-memory paths.
fn test_server() -> Arc<SyncServer> {
    let schema = counters_schema();
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost/unused")
        .expect("lazy pool");
    let router = ResourceRouter::from_schema(&schema);
    let storage = Storage::new(pool, schema, None);
    SyncServer::new(storage, router)
}

fn counter_event(origin: Option<&str>, counter: i64) -> MutationEvent {
    let mut payload = EncodedRow::new();
    payload.insert(
        "counter".into(),
        EncodedField::new(json!(counter), "2026-01-01T00:00:01.000Z"),
    );
    MutationEvent {
        mutation: Mutation {
            id: "srv-1".into(),
            resource: "counters".into(),
            resource_id: "0".into(),
            procedure: Procedure::Update,
            payload,
            mutation_id: Some("m-1".into()),
        },
        row: json!({"id": "0", "counter": counter}),
        origin: origin.map(str::to_string),
    }
}

fn subscribe(
    server: &SyncServer,
    sub_id: &str,
    conn_id: &str,
    resource: &str,
    query: serde_json::Value,
) {
    server.registry().insert(Subscription {
        sub_id: sub_id.into(),
        connection_id: conn_id.into(),
        resource: resource.into(),
        query: Query::parse(&query).unwrap(),
    });
}

#[tokio::test]
async fn matching_subscribers_receive_exactly_one_mutate() {
    let server = test_server();

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let conn_a = server.connect("node-a".into(), tx_a);
    let conn_b = server.connect("node-b".into(), tx_b);

    subscribe(&server, "s-a", &conn_a, "counters", json!({}));
    subscribe(&server, "s-b", &conn_b, "counters", json!({}));

    // Mutation originated by connection A.
    server.fan_out(&counter_event(Some(conn_a.as_str()), 2)).await;

    // Origin suppression: A gets nothing, B gets exactly one MUTATE.
    assert!(rx_a.try_recv().is_err());

    let msg = rx_b.try_recv().unwrap();
    let ServerMessage::Mutate {
        id,
        resource,
        resource_id,
        mutation_id,
        origin,
        ..
    } = msg
    else {
        panic!("expected MUTATE");
    };
    assert_eq!(id, None); // broadcasts carry no _id
    assert_eq!(resource, "counters");
    assert_eq!(resource_id, "0");
    assert_eq!(mutation_id.as_deref(), Some("m-1"));
    assert_eq!(origin.as_deref(), Some("node-a"));

    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn predicate_filters_subscribers() {
    let server = test_server();

    let (tx_low, mut rx_low) = mpsc::unbounded_channel();
    let (tx_high, mut rx_high) = mpsc::unbounded_channel();
    let conn_low = server.connect("node-low".into(), tx_low);
    let conn_high = server.connect("node-high".into(), tx_high);

    subscribe(
        &server,
        "s-low",
        &conn_low,
        "counters",
        json!({"where": {"counter": {"$lt": 10}}}),
    );
    subscribe(
        &server,
        "s-high",
        &conn_high,
        "counters",
        json!({"where": {"counter": {"$gte": 10}}}),
    );

    server.fan_out(&counter_event(None, 42)).await;

    assert!(rx_low.try_recv().is_err());
    assert!(matches!(
        rx_high.try_recv().unwrap(),
        ServerMessage::Mutate { .. }
    ));
}

#[tokio::test]
async fn other_resources_do_not_leak() {
    let server = test_server();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = server.connect("node-1".into(), tx);
    subscribe(&server, "s-users", &conn, "users", json!({}));

    server.fan_out(&counter_event(None, 1)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn disconnect_purges_subscriptions() {
    let server = test_server();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = server.connect("node-1".into(), tx);
    subscribe(&server, "s-1", &conn, "counters", json!({}));
    subscribe(&server, "s-2", &conn, "users", json!({}));

    assert_eq!(server.registry().snapshot().len(), 2);
    server.disconnect(&conn);
    assert_eq!(server.registry().snapshot().len(), 0);

    // Fan-out after close delivers nothing.
    server.fan_out(&counter_event(None, 1)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn null_matching_follows_sql_semantics() {
    let server = test_server();

    let (tx_null, mut rx_null) = mpsc::unbounded_channel();
    let (tx_not_null, mut rx_not_null) = mpsc::unbounded_channel();
    let conn_null = server.connect("node-null".into(), tx_null);
    let conn_not_null = server.connect("node-not-null".into(), tx_not_null);

    subscribe(
        &server,
        "s-null",
        &conn_null,
        "users",
        json!({"where": {"name": null}}),
    );
    subscribe(
        &server,
        "s-not-null",
        &conn_not_null,
        "users",
        json!({"where": {"name": {"$not": null}}}),
    );

    let mut payload = EncodedRow::new();
    payload.insert(
        "name".into(),
        EncodedField::new(serde_json::Value::Null, "2026-01-01T00:00:01.000Z"),
    );
    let event = MutationEvent {
        mutation: Mutation {
            id: "srv-2".into(),
            resource: "users".into(),
            resource_id: "u1".into(),
            procedure: Procedure::Update,
            payload,
            mutation_id: None,
        },
        row: json!({"id": "u1", "name": null}),
        origin: None,
    };
    server.fan_out(&event).await;

    assert!(matches!(
        rx_null.try_recv().unwrap(),
        ServerMessage::Mutate { .. }
    ));
    assert!(rx_not_null.try_recv().is_err());
}
