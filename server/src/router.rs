//! Resource router.
//!
//! A route binds a resource name to its collection and exposes the
//! collection operations to the protocol layer, with `before`/`after` hook
//! chains around each one. Hooks see the connection's context (identity,
//! claims) and reject by returning an error; a rejection surfaces as a
//! protocol error keyed to the originating message and never tears down the
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use lattice_engine::{EncodedRow, IncludeClause, Procedure, Query, Schema};
use serde_json::Value;

use crate::storage::{Storage, StorageError, WriteOutcome};

/// A hook rejection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Per-connection context passed to every hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Server-assigned connection id.
    pub connection_id: String,
    /// Client-announced node id.
    pub node_id: String,
    /// Arbitrary claims attached at connection time (e.g. from the bearer
    /// token). Policy is whatever the hooks make of them.
    pub claims: Value,
}

/// The operation a hook fires around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOperation {
    Find,
    FindOne,
    Insert,
    Update,
}

/// What the hook is looking at.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub resource: String,
    pub operation: RouteOperation,
    pub resource_id: Option<String>,
    /// The incoming payload for writes, the result row for `after` hooks.
    pub payload: Option<Value>,
}

/// A hook function.
pub type HookFn = Arc<dyn Fn(&HookContext, &HookEvent) -> Result<(), HookError> + Send + Sync>;

/// Errors surfaced by route dispatch.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One resource's handler surface.
pub struct ResourceRoute {
    resource: String,
    before: Vec<HookFn>,
    after: Vec<HookFn>,
}

impl ResourceRoute {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Add a hook that runs before every operation on this resource.
    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HookContext, &HookEvent) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.before.push(Arc::new(hook));
        self
    }

    /// Add a hook that runs after every operation on this resource.
    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HookContext, &HookEvent) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.after.push(Arc::new(hook));
        self
    }
}

/// Aggregates routes into the single surface the sync server dispatches
/// against.
#[derive(Default)]
pub struct ResourceRouter {
    routes: HashMap<String, ResourceRoute>,
}

impl ResourceRouter {
    /// A router with a bare route per schema collection.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut router = Self::default();
        for name in schema.collections.keys() {
            router.routes.insert(name.clone(), ResourceRoute::new(name));
        }
        router
    }

    /// Replace or add a route (typically one built with hooks).
    pub fn route(mut self, route: ResourceRoute) -> Self {
        self.routes.insert(route.resource.clone(), route);
        self
    }

    pub fn has_resource(&self, resource: &str) -> bool {
        self.routes.contains_key(resource)
    }

    /// Run a query through the route.
    pub async fn find(
        &self,
        storage: &Storage,
        ctx: &HookContext,
        resource: &str,
        query: &Query,
    ) -> Result<Vec<Value>, RouteError> {
        let route = self.expect_route(resource)?;
        let event = HookEvent {
            resource: resource.to_string(),
            operation: RouteOperation::Find,
            resource_id: None,
            payload: None,
        };
        run_hooks(&route.before, ctx, &event)?;
        let rows = storage.find(resource, query).await?;
        run_hooks(&route.after, ctx, &event)?;
        Ok(rows)
    }

    /// Fetch one row through the route.
    pub async fn find_one(
        &self,
        storage: &Storage,
        ctx: &HookContext,
        resource: &str,
        id: &str,
        include: Option<&IncludeClause>,
    ) -> Result<Option<Value>, RouteError> {
        let route = self.expect_route(resource)?;
        let event = HookEvent {
            resource: resource.to_string(),
            operation: RouteOperation::FindOne,
            resource_id: Some(id.to_string()),
            payload: None,
        };
        run_hooks(&route.before, ctx, &event)?;
        let row = storage.find_one(resource, id, include).await?;
        run_hooks(&route.after, ctx, &event)?;
        Ok(row)
    }

    /// Apply a protocol mutation through the route.
    pub async fn mutate(
        &self,
        storage: &Storage,
        ctx: &HookContext,
        resource: &str,
        procedure: Procedure,
        payload: EncodedRow,
        resource_id: Option<&str>,
        mutation_id: String,
    ) -> Result<WriteOutcome, RouteError> {
        let route = self.expect_route(resource)?;

        let operation = match procedure {
            Procedure::Insert => RouteOperation::Insert,
            _ => RouteOperation::Update,
        };
        let before_event = HookEvent {
            resource: resource.to_string(),
            operation,
            resource_id: resource_id.map(str::to_string),
            payload: Some(lattice_engine::infer_row(&payload)),
        };
        run_hooks(&route.before, ctx, &before_event)?;

        let outcome = storage
            .apply_encoded(
                resource,
                procedure,
                payload,
                resource_id,
                Some(mutation_id),
                Some(ctx.connection_id.clone()),
            )
            .await?;

        let after_event = HookEvent {
            resource: resource.to_string(),
            operation,
            resource_id: Some(outcome.resource_id.clone()),
            payload: Some(outcome.row.clone()),
        };
        run_hooks(&route.after, ctx, &after_event)?;

        Ok(outcome)
    }

    fn expect_route(&self, resource: &str) -> Result<&ResourceRoute, RouteError> {
        self.routes
            .get(resource)
            .ok_or_else(|| RouteError::UnknownResource(resource.to_string()))
    }
}

fn run_hooks(hooks: &[HookFn], ctx: &HookContext, event: &HookEvent) -> Result<(), HookError> {
    for hook in hooks {
        hook(ctx, event)?;
    }
    Ok(())
}
