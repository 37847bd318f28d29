//! Sync server: message dispatch, subscriptions, mutation fan-out.
//!
//! One `SyncServer` owns the connection registry and subscription index and
//! dispatches protocol messages against the resource router. Request
//! handling is sequential per connection (the socket task awaits each
//! message); fan-out runs on its own task fed by the storage engine's
//! mutation event channel.

use std::sync::Arc;
use std::time::Duration;

use lattice_engine::{
    extract_include_from_where, ClientMessage, ErrorCode, FieldCondition, MutationEvent, Query,
    ServerMessage, WhereClause,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::router::{HookContext, ResourceRouter, RouteError};
use crate::storage::{Storage, StorageError};

use super::connection::{ConnectionManager, MessageSender};
use super::registry::{Subscription, SubscriptionRegistry};

pub struct SyncServer {
    storage: Storage,
    router: Arc<ResourceRouter>,
    connections: ConnectionManager,
    registry: SubscriptionRegistry,
}

impl SyncServer {
    pub fn new(storage: Storage, router: ResourceRouter) -> Arc<Self> {
        Arc::new(Self {
            storage,
            router: Arc::new(router),
            connections: ConnectionManager::new(),
            registry: SubscriptionRegistry::new(),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register a connection; returns its id.
    pub fn connect(&self, node_id: String, sender: MessageSender) -> String {
        self.connections.register(node_id, sender)
    }

    /// Drop a connection and purge its subscriptions from both indexes.
    /// In-flight writes complete; their acks go nowhere.
    pub fn disconnect(&self, conn_id: &str) {
        let purged = self.registry.remove_connection(conn_id);
        self.connections.unregister(conn_id);
        tracing::debug!(conn_id = %conn_id, purged, "connection closed, subscriptions purged");
    }

    /// Record inbound activity.
    pub fn touch(&self, conn_id: &str) {
        self.connections.touch(conn_id);
    }

    /// Send a message to one connection.
    pub fn send(&self, conn_id: &str, message: ServerMessage) -> bool {
        self.connections.send_to(conn_id, message)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    /// Handle one inbound text frame. `None` means no reply is due
    /// (UNSUBSCRIBE acknowledges by silence).
    pub async fn handle_text(&self, ctx: &HookContext, raw: &str) -> Option<ServerMessage> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(error) => {
                return Some(ServerMessage::error(
                    None,
                    ErrorCode::Malformed,
                    format!("invalid message: {error}"),
                ));
            }
        };
        let id = value
            .get("_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(error) => {
                let code = if error.to_string().contains("unknown variant") {
                    ErrorCode::UnknownType
                } else {
                    ErrorCode::Malformed
                };
                return Some(ServerMessage::error(id, code, error.to_string()));
            }
        };

        Some(match message {
            ClientMessage::Subscribe {
                id,
                resource,
                query,
            } => self.subscribe(ctx, id, resource, query).await,
            ClientMessage::Unsubscribe { id, sub_id } => {
                return self.unsubscribe(ctx, id, sub_id);
            }
            ClientMessage::Mutate {
                id,
                resource,
                procedure,
                payload,
                mutation_id,
                resource_id,
            } => {
                self.mutate(ctx, id, resource, procedure, payload, mutation_id, resource_id)
                    .await
            }
            ClientMessage::Ping { id } => ServerMessage::Pong { id },
        })
    }

    async fn subscribe(
        &self,
        ctx: &HookContext,
        request_id: String,
        resource: String,
        query: Option<Value>,
    ) -> ServerMessage {
        if !self.router.has_resource(&resource) {
            return ServerMessage::error(
                Some(request_id),
                ErrorCode::UnknownResource,
                format!("unknown resource: {resource}"),
            );
        }

        let query = match query {
            Some(raw) => match Query::parse(&raw) {
                Ok(query) => query,
                Err(error) => {
                    return ServerMessage::error(
                        Some(request_id),
                        ErrorCode::Validation,
                        error.to_string(),
                    );
                }
            },
            None => Query::default(),
        };

        let snapshot = match self.router.find(&self.storage, ctx, &resource, &query).await {
            Ok(rows) => rows,
            Err(error) => return route_error(Some(request_id), error),
        };

        let sub_id = uuid::Uuid::new_v4().to_string();
        self.registry.insert(Subscription {
            sub_id: sub_id.clone(),
            connection_id: ctx.connection_id.clone(),
            resource: resource.clone(),
            query,
        });

        tracing::debug!(
            conn_id = %ctx.connection_id,
            resource = %resource,
            sub_id = %sub_id,
            rows = snapshot.len(),
            "subscription registered"
        );

        ServerMessage::Subscribed {
            id: request_id,
            sub_id,
            snapshot,
        }
    }

    fn unsubscribe(
        &self,
        ctx: &HookContext,
        request_id: String,
        sub_id: String,
    ) -> Option<ServerMessage> {
        match self.registry.remove(&sub_id) {
            Some(subscription) if subscription.connection_id == ctx.connection_id => None,
            Some(subscription) => {
                // Someone else's subscription: put it back and refuse.
                self.registry.insert(subscription);
                Some(ServerMessage::error(
                    Some(request_id),
                    ErrorCode::UnknownSubscription,
                    format!("subscription {sub_id} is not yours"),
                ))
            }
            None => Some(ServerMessage::error(
                Some(request_id),
                ErrorCode::UnknownSubscription,
                format!("unknown subscription: {sub_id}"),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn mutate(
        &self,
        ctx: &HookContext,
        request_id: String,
        resource: String,
        procedure: lattice_engine::Procedure,
        payload: lattice_engine::EncodedRow,
        mutation_id: String,
        resource_id: Option<String>,
    ) -> ServerMessage {
        let outcome = match self
            .router
            .mutate(
                &self.storage,
                ctx,
                &resource,
                procedure,
                payload,
                resource_id.as_deref(),
                mutation_id.clone(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => return route_error(Some(request_id), error),
        };

        // The originator gets an ack carrying the surviving values of every
        // touched field; the broadcast goes to everyone else via fan-out.
        ServerMessage::Mutate {
            id: Some(request_id),
            resource,
            resource_id: outcome.resource_id,
            procedure,
            payload: outcome.ack,
            mutation_id: Some(mutation_id),
            origin: None,
        }
    }

    /// Fan a committed mutation out to every matching subscription, skipping
    /// the originating connection.
    pub async fn fan_out(&self, event: &MutationEvent) {
        let resource = &event.mutation.resource;
        let snapshot = self.registry.snapshot();
        let origin_node = event
            .origin
            .as_deref()
            .and_then(|conn_id| self.connections.node_id(conn_id));

        for subscription in snapshot.for_resource(resource) {
            if event.origin.as_deref() == Some(subscription.connection_id.as_str()) {
                continue;
            }

            let matched = match &subscription.query.where_clause {
                None => true,
                Some(where_clause) if !touches_relations(where_clause) => {
                    self.matches_in_memory(resource, where_clause, &event.row)
                }
                Some(_) => match self.matches_with_joins(subscription, event).await {
                    Ok(matched) => matched,
                    Err(error) => {
                        tracing::warn!(
                            sub_id = %subscription.sub_id,
                            %error,
                            "fan-out predicate evaluation failed, skipping subscriber"
                        );
                        continue;
                    }
                },
            };

            if matched {
                let mut message = ServerMessage::broadcast(&event.mutation);
                if let ServerMessage::Mutate { origin, .. } = &mut message {
                    *origin = origin_node.clone();
                }
                if !self.connections.send_to(&subscription.connection_id, message) {
                    tracing::debug!(
                        sub_id = %subscription.sub_id,
                        conn_id = %subscription.connection_id,
                        "subscriber connection gone, skipping"
                    );
                }
            }
        }
    }

    fn matches_in_memory(&self, resource: &str, where_clause: &WhereClause, row: &Value) -> bool {
        let schema = self.storage.schema();
        match schema.collection(resource) {
            Some(collection) => where_clause.matches(schema, collection, row),
            None => false,
        }
    }

    /// Re-evaluate a relation-traversing predicate against storage: the
    /// post-merge row matches iff the subscription's query, narrowed to this
    /// row's primary key, still returns it.
    async fn matches_with_joins(
        &self,
        subscription: &Subscription,
        event: &MutationEvent,
    ) -> Result<bool, StorageError> {
        let resource = &event.mutation.resource;
        let collection = self.storage.schema().expect_collection(resource)?;
        let pk = collection.primary_field().to_string();

        let by_id = WhereClause::Fields(
            [(
                pk,
                FieldCondition::Equals(Value::String(event.mutation.resource_id.clone())),
            )]
            .into_iter()
            .collect(),
        );
        let mut branches = vec![by_id];
        if let Some(where_clause) = &subscription.query.where_clause {
            branches.push(where_clause.clone());
        }

        let probe = Query {
            where_clause: Some(WhereClause::And(branches)),
            include: None,
            order_by: None,
            limit: Some(1),
        };
        Ok(!self.storage.find(resource, &probe).await?.is_empty())
    }

    /// Drive fan-out from the storage engine's mutation event channel.
    pub fn spawn_fan_out(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MutationEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                server.fan_out(&event).await;
            }
            tracing::debug!("mutation event channel closed, fan-out task exiting");
        })
    }

    /// Periodically reap connections idle beyond `timeout`.
    pub fn spawn_reaper(self: &Arc<Self>, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(timeout / 2);
            loop {
                interval.tick().await;
                for conn_id in server.connections.idle_connections(timeout) {
                    tracing::info!(conn_id = %conn_id, "reaping idle connection");
                    server.disconnect(&conn_id);
                }
            }
        })
    }
}

fn touches_relations(where_clause: &WhereClause) -> bool {
    !extract_include_from_where(where_clause).0.is_empty()
}

fn route_error(id: Option<String>, error: RouteError) -> ServerMessage {
    match error {
        RouteError::UnknownResource(resource) => ServerMessage::error(
            id,
            ErrorCode::UnknownResource,
            format!("unknown resource: {resource}"),
        ),
        RouteError::Hook(rejection) => {
            ServerMessage::error(id, ErrorCode::Auth, rejection.to_string())
        }
        RouteError::Storage(StorageError::Engine(engine)) => {
            ServerMessage::error(id, ErrorCode::Validation, engine.to_string())
        }
        RouteError::Storage(StorageError::UnsupportedProcedure(what)) => {
            ServerMessage::error(id, ErrorCode::Unsupported, what)
        }
        RouteError::Storage(StorageError::RowNotFound { resource, id: row }) => {
            ServerMessage::error(
                id,
                ErrorCode::Validation,
                format!("row not found: {resource}/{row}"),
            )
        }
        RouteError::Storage(error) => {
            tracing::error!(%error, "storage failure during dispatch");
            ServerMessage::error(id, ErrorCode::Storage, "storage failure".to_string())
        }
    }
}
