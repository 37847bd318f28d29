//! Client API.
//!
//! A [`LatticeClient`] owns the schema, the per-collection stores, and the
//! connection supervisor task. Collection handles issue optimistic writes
//! and subscribe to live query results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use lattice_engine::{MonotonicClock, Procedure, Query, Schema};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{Command, PendingMutation, Stores, Supervisor, SupervisorConfig};
use crate::error::{ClientError, Result};
use crate::store::CollectionStore;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the sync server, e.g. `ws://localhost:3000/sync/ws`.
    pub url: String,
    /// Stable identifier for this client session.
    pub node_id: String,
    /// Heartbeat interval; the connection is considered dead after two
    /// missed pongs.
    pub heartbeat: Duration,
    /// Bound on the outbound queue. Overflow drops the oldest non-mutation
    /// messages; mutations are never dropped.
    pub queue_limit: usize,
    /// First reconnect delay; doubles per attempt up to `backoff_cap`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            node_id: uuid::Uuid::new_v4().to_string(),
            heartbeat: Duration::from_secs(20),
            queue_limit: 256,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }
}

struct Shared {
    schema: Arc<Schema>,
    stores: Stores,
    clock: Mutex<MonotonicClock>,
}

/// A connected sync client.
///
/// Cheap to clone; all clones share one connection and one set of stores.
#[derive(Clone)]
pub struct LatticeClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl LatticeClient {
    /// Create the client and start its connection supervisor.
    ///
    /// The connection is established in the background with exponential
    /// backoff; writes issued while offline apply locally and queue.
    pub fn connect(config: ClientConfig, schema: Schema) -> Self {
        let shared = Arc::new(Shared {
            schema: Arc::new(schema),
            stores: Arc::new(Mutex::new(HashMap::new())),
            clock: Mutex::new(MonotonicClock::new()),
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            SupervisorConfig {
                url: config.url,
                node_id: config.node_id,
                heartbeat: config.heartbeat,
                queue_limit: config.queue_limit,
                backoff_base: config.backoff_base,
                backoff_cap: config.backoff_cap,
            },
            shared.stores.clone(),
            commands_rx,
        );
        tokio::spawn(supervisor.run());

        Self {
            shared,
            commands: commands_tx,
        }
    }

    /// A handle onto one collection.
    pub fn collection(&self, name: &str) -> Result<CollectionHandle> {
        if self.shared.schema.collection(name).is_none() {
            return Err(ClientError::UnknownCollection(name.to_string()));
        }
        Ok(CollectionHandle {
            client: self.clone(),
            resource: name.to_string(),
        })
    }

    fn stamp(&self) -> String {
        let mut clock = self
            .shared
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        clock.stamp(Utc::now())
    }
}

/// Handle onto one collection: subscribe and write.
#[derive(Clone)]
pub struct CollectionHandle {
    client: LatticeClient,
    resource: String,
}

impl CollectionHandle {
    /// Subscribe to this collection and observe its rows.
    ///
    /// The subscription is registered on first call and re-established on
    /// every reconnect; the returned watch channel updates whenever a row's
    /// materialized value actually changes.
    pub fn subscribe(&self, query: Option<Query>) -> Result<watch::Receiver<Vec<Value>>> {
        let schema = &self.client.shared.schema;
        let collection = schema.expect_collection(&self.resource)?;
        if let Some(query) = &query {
            query.validate(schema, collection)?;
        }

        let receiver = {
            let mut stores = lock_stores(&self.client.shared.stores);
            stores
                .entry(self.resource.clone())
                .or_insert_with(|| CollectionStore::new(collection.clone()))
                .watch()
        };

        self.client
            .commands
            .send(Command::Subscribe {
                resource: self.resource.clone(),
                query: query.map(|q| q.to_value()),
            })
            .map_err(|_| ClientError::ConnectionClosed)?;

        Ok(receiver)
    }

    /// Insert a row optimistically. The returned future resolves when the
    /// server acknowledges, with the post-merge authoritative row; a
    /// rejection reverts the local application and surfaces the error.
    ///
    /// A missing primary field is filled with a fresh UUID.
    pub async fn insert(&self, mut value: Value) -> Result<Value> {
        let schema = &self.client.shared.schema;
        let collection = schema.expect_collection(&self.resource)?;
        let pk = collection.primary_field().to_string();

        let id = match value.get(&pk).and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Some(obj) = value.as_object_mut() {
                    obj.insert(pk.clone(), Value::String(id.clone()));
                }
                id
            }
        };

        self.mutate(Procedure::Insert, id, value).await
    }

    /// Update fields of a row optimistically.
    pub async fn update(&self, id: &str, value: Value) -> Result<Value> {
        self.mutate(Procedure::Update, id.to_string(), value).await
    }

    /// The current inferred rows, without subscribing.
    pub fn rows(&self) -> Vec<Value> {
        let stores = lock_stores(&self.client.shared.stores);
        stores
            .get(&self.resource)
            .map(|store| store.inferred())
            .unwrap_or_default()
    }

    async fn mutate(&self, procedure: Procedure, id: String, value: Value) -> Result<Value> {
        let schema = &self.client.shared.schema;
        let collection = schema.expect_collection(&self.resource)?;

        let ts = self.client.stamp();
        let payload = collection.encode_row(&value, &ts)?;
        let mutation_id = uuid::Uuid::new_v4().to_string();

        // Optimistic application, remembering the prior state for rollback.
        let previous = {
            let mut stores = lock_stores(&self.client.shared.stores);
            let store = stores
                .entry(self.resource.clone())
                .or_insert_with(|| CollectionStore::new(collection.clone()));
            let previous = store.row(&id).cloned();
            store.apply(&id, payload.clone());
            previous
        };

        let (responder, response) = oneshot::channel();
        self.client
            .commands
            .send(Command::Mutate(PendingMutation {
                resource: self.resource.clone(),
                resource_id: id,
                procedure,
                payload,
                previous,
                mutation_id,
                responder: Some(responder),
            }))
            .map_err(|_| ClientError::ConnectionClosed)?;

        response.await.map_err(|_| ClientError::ConnectionClosed)?
    }
}

fn lock_stores(stores: &Stores) -> std::sync::MutexGuard<'_, HashMap<String, CollectionStore>> {
    stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_engine::{collection, create_schema, id, number, string};
    use serde_json::json;

    fn schema() -> Schema {
        create_schema(
            [collection(
                "counters",
                [
                    ("id", id()),
                    ("counter", number().nullable()),
                    ("label", string().nullable()),
                ],
            )],
            [],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_collection_is_rejected() {
        let client = LatticeClient::connect(ClientConfig::new("ws://localhost:0/sync/ws"), schema());
        assert!(matches!(
            client.collection("nope"),
            Err(ClientError::UnknownCollection(_))
        ));
        assert!(client.collection("counters").is_ok());
    }

    #[tokio::test]
    async fn optimistic_write_is_visible_immediately() {
        let client = LatticeClient::connect(ClientConfig::new("ws://localhost:0/sync/ws"), schema());
        let counters = client.collection("counters").unwrap();
        let mut observed = counters.subscribe(None).unwrap();

        // The server is unreachable; the write still applies locally while
        // the ack stays pending.
        let pending = {
            let counters = counters.clone();
            tokio::spawn(async move {
                counters
                    .insert(json!({"id": "0", "counter": 1}))
                    .await
            })
        };

        observed.changed().await.unwrap();
        let rows = observed.borrow().clone();
        assert_eq!(rows, vec![json!({"id": "0", "counter": 1})]);
        assert_eq!(counters.rows().len(), 1);

        pending.abort();
    }

    #[tokio::test]
    async fn insert_fills_missing_primary_key() {
        let client = LatticeClient::connect(ClientConfig::new("ws://localhost:0/sync/ws"), schema());
        let counters = client.collection("counters").unwrap();

        let pending = {
            let counters = counters.clone();
            tokio::spawn(async move { counters.insert(json!({"counter": 1})).await })
        };

        // Wait for the local application.
        let mut observed = counters.subscribe(None).unwrap();
        if counters.rows().is_empty() {
            observed.changed().await.unwrap();
        }

        let rows = counters.rows();
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["id"].as_str().is_some_and(|id| !id.is_empty()));

        pending.abort();
    }

    #[tokio::test]
    async fn subscribe_validates_query() {
        let client = LatticeClient::connect(ClientConfig::new("ws://localhost:0/sync/ws"), schema());
        let counters = client.collection("counters").unwrap();

        let bad = Query::parse(&json!({"where": {"label": {"$gt": "a"}}})).unwrap();
        assert!(matches!(
            counters.subscribe(Some(bad)),
            Err(ClientError::Engine(_))
        ));
    }
}
