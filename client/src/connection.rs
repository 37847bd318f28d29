//! Connection supervisor.
//!
//! One task owns the WebSocket and all sync state that must survive
//! reconnects: the registered subscriptions, the unacknowledged mutation
//! buffer, and the bounded outbound queue. On every (re)connect it
//! re-subscribes everything and replays pending mutations in submission
//! order with their original mutation ids; the server's merge makes the
//! replays idempotent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lattice_engine::{infer_row, ClientMessage, EncodedRow, Procedure, ServerMessage};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;
use crate::store::CollectionStore;

/// Shared per-collection stores, written by the supervisor and read by
/// observers through their watch channels.
pub(crate) type Stores = Arc<Mutex<HashMap<String, CollectionStore>>>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An optimistic write awaiting its ack.
pub(crate) struct PendingMutation {
    pub resource: String,
    pub resource_id: String,
    pub procedure: Procedure,
    pub payload: EncodedRow,
    /// Row state before the optimistic apply, for rollback.
    pub previous: Option<EncodedRow>,
    pub mutation_id: String,
    pub responder: Option<oneshot::Sender<Result<Value, ClientError>>>,
}

/// Commands from the client API into the supervisor.
pub(crate) enum Command {
    Subscribe {
        resource: String,
        query: Option<Value>,
    },
    Mutate(PendingMutation),
}

#[derive(Debug, Clone)]
pub(crate) struct SupervisorConfig {
    pub url: String,
    pub node_id: String,
    pub heartbeat: Duration,
    pub queue_limit: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

#[derive(Default)]
struct SubscriptionState {
    query: Option<Value>,
    request_id: Option<String>,
    sub_id: Option<String>,
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

pub(crate) struct Supervisor {
    config: SupervisorConfig,
    stores: Stores,
    commands: mpsc::UnboundedReceiver<Command>,
    subscriptions: HashMap<String, SubscriptionState>,
    pending: Vec<PendingMutation>,
    outbox: VecDeque<ClientMessage>,
    saw_pong: bool,
}

impl Supervisor {
    pub(crate) fn new(
        config: SupervisorConfig,
        stores: Stores,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            config,
            stores,
            commands,
            subscriptions: HashMap::new(),
            pending: Vec::new(),
            outbox: VecDeque::new(),
            saw_pong: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            match self.connect().await {
                Ok(socket) => {
                    attempt = 0;
                    tracing::info!(url = %self.config.url, "connected");
                    if let SessionEnd::Shutdown = self.session(socket).await {
                        return;
                    }
                    tracing::warn!("disconnected");
                }
                Err(error) => {
                    tracing::warn!(%error, "connect failed");
                }
            }

            let delay = backoff(attempt, self.config.backoff_base, self.config.backoff_cap);
            attempt = attempt.saturating_add(1);
            tracing::info!(?delay, "reconnecting after backoff");

            // Commands keep flowing while offline: writes apply optimistically
            // and queue, subscriptions register for the next session.
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        None => return,
                        Some(command) => self.register_command(command),
                    },
                }
            }
        }
    }

    async fn connect(&self) -> Result<Socket, ClientError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let node_id = HeaderValue::from_str(&self.config.node_id)
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        request.headers_mut().insert("x-node-id", node_id);

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(socket)
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        // Fresh session: re-subscribe everything and replay unacknowledged
        // mutations in submission order with their original ids.
        self.outbox.clear();
        let resubscribes: Vec<ClientMessage> = self
            .subscriptions
            .iter_mut()
            .map(|(resource, sub)| {
                let request_id = uuid::Uuid::new_v4().to_string();
                sub.request_id = Some(request_id.clone());
                sub.sub_id = None;
                ClientMessage::Subscribe {
                    id: request_id,
                    resource: resource.clone(),
                    query: sub.query.clone(),
                }
            })
            .collect();
        let replays: Vec<ClientMessage> = self.pending.iter().map(mutate_message).collect();
        for message in resubscribes.into_iter().chain(replays) {
            self.enqueue(message);
        }
        if self.flush(&mut sink).await.is_err() {
            return SessionEnd::Disconnected;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();
        let mut awaiting_pongs: u32 = 0;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_server_text(&text),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(%error, "socket error");
                        return SessionEnd::Disconnected;
                    }
                },
                command = self.commands.recv() => match command {
                    None => return SessionEnd::Shutdown,
                    Some(command) => self.register_command(command),
                },
                _ = heartbeat.tick() => {
                    if awaiting_pongs >= 2 {
                        tracing::warn!("two pongs missed, treating connection as dead");
                        return SessionEnd::Disconnected;
                    }
                    awaiting_pongs += 1;
                    self.enqueue(ClientMessage::Ping {
                        id: uuid::Uuid::new_v4().to_string(),
                    });
                }
            }

            if self.saw_pong {
                self.saw_pong = false;
                awaiting_pongs = 0;
            }
            if self.flush(&mut sink).await.is_err() {
                return SessionEnd::Disconnected;
            }
        }
    }

    /// Record a command and, when a session is live, queue its message.
    /// While offline the subscription/pending state alone is enough: the
    /// next session start sends everything.
    fn register_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { resource, query } => {
                let request_id = uuid::Uuid::new_v4().to_string();
                self.subscriptions.insert(
                    resource.clone(),
                    SubscriptionState {
                        query: query.clone(),
                        request_id: Some(request_id.clone()),
                        sub_id: None,
                    },
                );
                self.enqueue(ClientMessage::Subscribe {
                    id: request_id,
                    resource,
                    query,
                });
            }
            Command::Mutate(pending) => {
                self.enqueue(mutate_message(&pending));
                self.pending.push(pending);
            }
        }
    }

    /// Bounded outbound queue: overflow drops the oldest non-mutation
    /// message; mutations are never dropped.
    fn enqueue(&mut self, message: ClientMessage) {
        if self.outbox.len() >= self.config.queue_limit {
            let droppable = self
                .outbox
                .iter()
                .position(|m| !matches!(m, ClientMessage::Mutate { .. }));
            match droppable {
                Some(index) => {
                    let _ = self.outbox.remove(index);
                    tracing::warn!("outbound queue full, dropped oldest non-mutation message");
                }
                None => {
                    tracing::warn!(
                        queued = self.outbox.len(),
                        "outbound queue over limit with mutations only, keeping all"
                    );
                }
            }
        }
        self.outbox.push_back(message);
    }

    async fn flush<S>(&mut self, sink: &mut S) -> Result<(), ()>
    where
        S: SinkExt<Message> + Unpin,
    {
        while let Some(message) = self.outbox.pop_front() {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!(%error, "failed to serialize outbound message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                // Session is over; pending mutations replay on reconnect.
                return Err(());
            }
        }
        Ok(())
    }

    fn handle_server_text(&mut self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "unparseable server message");
                return;
            }
        };

        match message {
            ServerMessage::Pong { .. } => self.saw_pong = true,

            ServerMessage::Subscribed {
                id,
                sub_id,
                snapshot,
            } => {
                let matched = self
                    .subscriptions
                    .iter_mut()
                    .find(|(_, sub)| sub.request_id.as_deref() == Some(id.as_str()));
                let Some((resource, sub)) = matched else {
                    tracing::warn!(request_id = %id, "SUBSCRIBED for unknown request");
                    return;
                };
                sub.sub_id = Some(sub_id);
                let resource = resource.clone();

                let mut stores = lock(&self.stores);
                if let Some(store) = stores.get_mut(&resource) {
                    store.apply_snapshot(&snapshot);
                }
                tracing::debug!(resource = %resource, rows = snapshot.len(), "snapshot merged");
            }

            ServerMessage::Mutate {
                id,
                resource,
                resource_id,
                payload,
                mutation_id,
                ..
            } => {
                // An ack carries our _id (= mutation id); everything else is
                // a broadcast from another client.
                if id.is_some() {
                    if let Some(index) = mutation_id
                        .as_ref()
                        .and_then(|mid| self.pending.iter().position(|p| &p.mutation_id == mid))
                    {
                        let mut entry = self.pending.remove(index);
                        let row = self.apply_to_store(&resource, &resource_id, payload);
                        if let Some(responder) = entry.responder.take() {
                            let _ = responder.send(Ok(row));
                        }
                        return;
                    }
                }
                self.apply_to_store(&resource, &resource_id, payload);
            }

            ServerMessage::Error { id, code, message } => {
                let Some(id) = id else {
                    tracing::warn!(%message, "server error");
                    return;
                };

                // A rejected mutation reverts its optimistic application.
                if let Some(index) = self.pending.iter().position(|p| p.mutation_id == id) {
                    let mut entry = self.pending.remove(index);
                    {
                        let mut stores = lock(&self.stores);
                        if let Some(store) = stores.get_mut(&entry.resource) {
                            store.restore(&entry.resource_id, entry.previous.take());
                        }
                    }
                    if let Some(responder) = entry.responder.take() {
                        let _ = responder.send(Err(ClientError::Rejected { code, message }));
                    }
                    return;
                }

                // A failed subscription leaves no local state.
                let failed = self
                    .subscriptions
                    .iter()
                    .find(|(_, sub)| sub.request_id.as_deref() == Some(id.as_str()))
                    .map(|(resource, _)| resource.clone());
                if let Some(resource) = failed {
                    tracing::warn!(resource = %resource, %message, "subscription rejected");
                    self.subscriptions.remove(&resource);
                    return;
                }

                tracing::warn!(request_id = %id, %message, "server error");
            }
        }
    }

    fn apply_to_store(&self, resource: &str, id: &str, payload: EncodedRow) -> Value {
        let mut stores = lock(&self.stores);
        match stores.get_mut(resource) {
            Some(store) => {
                store.apply(id, payload);
                store.row(id).map(infer_row).unwrap_or(Value::Null)
            }
            None => Value::Null,
        }
    }
}

fn mutate_message(pending: &PendingMutation) -> ClientMessage {
    ClientMessage::Mutate {
        id: pending.mutation_id.clone(),
        resource: pending.resource.clone(),
        procedure: pending.procedure,
        payload: pending.payload.clone(),
        mutation_id: pending.mutation_id.clone(),
        resource_id: Some(pending.resource_id.clone()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_engine::EncodedField;
    use serde_json::json;

    fn supervisor() -> Supervisor {
        let (_tx, rx) = mpsc::unbounded_channel();
        Supervisor::new(
            SupervisorConfig {
                url: "ws://localhost:3000/sync/ws".into(),
                node_id: "node-test".into(),
                heartbeat: Duration::from_secs(20),
                queue_limit: 4,
                backoff_base: Duration::from_millis(500),
                backoff_cap: Duration::from_secs(30),
            },
            Arc::new(Mutex::new(HashMap::new())),
            rx,
        )
    }

    fn ping(id: &str) -> ClientMessage {
        ClientMessage::Ping { id: id.into() }
    }

    fn mutate(mutation_id: &str) -> ClientMessage {
        let mut payload = EncodedRow::new();
        payload.insert(
            "counter".into(),
            EncodedField::new(json!(1), "2026-01-01T00:00:00.000Z"),
        );
        ClientMessage::Mutate {
            id: mutation_id.into(),
            resource: "counters".into(),
            procedure: Procedure::Update,
            payload,
            mutation_id: mutation_id.into(),
            resource_id: Some("0".into()),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);

        assert_eq!(backoff(0, base, cap), Duration::from_millis(500));
        assert_eq!(backoff(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff(3, base, cap), Duration::from_secs(4));
        assert_eq!(backoff(10, base, cap), cap);
        assert_eq!(backoff(u32::MAX, base, cap), cap);
    }

    #[test]
    fn overflow_drops_oldest_non_mutation() {
        let mut supervisor = supervisor();

        supervisor.enqueue(ping("p1"));
        supervisor.enqueue(mutate("m1"));
        supervisor.enqueue(ping("p2"));
        supervisor.enqueue(mutate("m2"));
        // Queue is at the limit of 4; the oldest ping goes.
        supervisor.enqueue(mutate("m3"));

        let ids: Vec<String> = supervisor
            .outbox
            .iter()
            .map(|m| match m {
                ClientMessage::Ping { id } => format!("ping:{id}"),
                ClientMessage::Mutate { mutation_id, .. } => format!("mutate:{mutation_id}"),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            ids,
            vec!["mutate:m1", "ping:p2", "mutate:m2", "mutate:m3"]
        );
    }

    #[test]
    fn overflow_never_drops_mutations() {
        let mut supervisor = supervisor();

        for i in 0..6 {
            supervisor.enqueue(mutate(&format!("m{i}")));
        }

        // All six are still queued.
        assert_eq!(supervisor.outbox.len(), 6);
        assert!(supervisor
            .outbox
            .iter()
            .all(|m| matches!(m, ClientMessage::Mutate { .. })));
    }

    #[test]
    fn ack_resolves_pending_and_applies_authoritative_fields() {
        let mut supervisor = supervisor();

        // A store for counters with an optimistic write at :00.
        let schema = lattice_engine::create_schema(
            [lattice_engine::collection(
                "counters",
                [
                    ("id", lattice_engine::id()),
                    ("counter", lattice_engine::number().nullable()),
                ],
            )],
            [],
        )
        .unwrap();
        let counters = schema.collection("counters").unwrap().clone();
        let mut store = CollectionStore::new(counters.clone());
        let optimistic = counters
            .encode_row(&json!({"id": "0", "counter": 1}), "2026-01-01T00:00:00.000Z")
            .unwrap();
        store.apply("0", optimistic.clone());
        lock(&supervisor.stores).insert("counters".into(), store);

        let (responder, mut response) = oneshot::channel();
        supervisor.pending.push(PendingMutation {
            resource: "counters".into(),
            resource_id: "0".into(),
            procedure: Procedure::Update,
            payload: optimistic,
            previous: None,
            mutation_id: "m-1".into(),
            responder: Some(responder),
        });

        // The ack carries the surviving value: a concurrent :01 write won.
        let ack = serde_json::to_string(&ServerMessage::Mutate {
            id: Some("m-1".into()),
            resource: "counters".into(),
            resource_id: "0".into(),
            procedure: Procedure::Update,
            payload: counters
                .encode_row(&json!({"counter": 2}), "2026-01-01T00:00:01.000Z")
                .unwrap(),
            mutation_id: Some("m-1".into()),
            origin: None,
        })
        .unwrap();
        supervisor.handle_server_text(&ack);

        assert!(supervisor.pending.is_empty());
        let row = response.try_recv().unwrap().unwrap();
        assert_eq!(row["counter"], json!(2));

        let stores = lock(&supervisor.stores);
        let store = stores.get("counters").unwrap();
        assert_eq!(store.row("0").unwrap()["counter"].value, json!(2));
    }

    #[test]
    fn error_reverts_optimistic_write() {
        let mut supervisor = supervisor();

        let schema = lattice_engine::create_schema(
            [lattice_engine::collection(
                "counters",
                [
                    ("id", lattice_engine::id()),
                    ("counter", lattice_engine::number().nullable()),
                ],
            )],
            [],
        )
        .unwrap();
        let counters = schema.collection("counters").unwrap().clone();
        let mut store = CollectionStore::new(counters.clone());

        let base = counters
            .encode_row(&json!({"id": "0", "counter": 1}), "2026-01-01T00:00:00.000Z")
            .unwrap();
        store.apply("0", base);
        let previous = store.row("0").cloned();

        let optimistic = counters
            .encode_row(&json!({"counter": 5}), "2026-01-01T00:00:01.000Z")
            .unwrap();
        store.apply("0", optimistic.clone());
        lock(&supervisor.stores).insert("counters".into(), store);

        let (responder, mut response) = oneshot::channel();
        supervisor.pending.push(PendingMutation {
            resource: "counters".into(),
            resource_id: "0".into(),
            procedure: Procedure::Update,
            payload: optimistic,
            previous,
            mutation_id: "m-9".into(),
            responder: Some(responder),
        });

        let rejection = serde_json::to_string(&ServerMessage::error(
            Some("m-9".into()),
            lattice_engine::ErrorCode::Auth,
            "hook rejected",
        ))
        .unwrap();
        supervisor.handle_server_text(&rejection);

        assert!(supervisor.pending.is_empty());
        assert!(matches!(
            response.try_recv().unwrap(),
            Err(ClientError::Rejected { .. })
        ));

        let stores = lock(&supervisor.stores);
        let store = stores.get("counters").unwrap();
        assert_eq!(store.row("0").unwrap()["counter"].value, json!(1));
    }

    #[test]
    fn broadcast_applies_without_touching_pending() {
        let mut supervisor = supervisor();

        let schema = lattice_engine::create_schema(
            [lattice_engine::collection(
                "counters",
                [
                    ("id", lattice_engine::id()),
                    ("counter", lattice_engine::number().nullable()),
                ],
            )],
            [],
        )
        .unwrap();
        let counters = schema.collection("counters").unwrap().clone();
        lock(&supervisor.stores).insert("counters".into(), CollectionStore::new(counters.clone()));

        let broadcast = serde_json::to_string(&ServerMessage::Mutate {
            id: None,
            resource: "counters".into(),
            resource_id: "0".into(),
            procedure: Procedure::Insert,
            payload: counters
                .encode_row(&json!({"id": "0", "counter": 7}), "2026-01-01T00:00:02.000Z")
                .unwrap(),
            mutation_id: Some("someone-elses".into()),
            origin: Some("node-other".into()),
        })
        .unwrap();
        supervisor.handle_server_text(&broadcast);

        let stores = lock(&supervisor.stores);
        let store = stores.get("counters").unwrap();
        assert_eq!(store.row("0").unwrap()["counter"].value, json!(7));
    }
}
