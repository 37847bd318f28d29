//! Storage engine: materialized collections in PostgreSQL.
//!
//! Every collection `C` is projected to two parallel tables: `C` holds the
//! live values (one column per field, FK columns for to-one relations) and
//! `C_meta` holds the per-field timestamp of the last accepted write. Writes
//! go through the engine's merge: the row is locked, the current
//! materialized state is read from both tables, the incoming mutation is
//! merged field-wise, and only the accepted diff is persisted.
//!
//! Every accepted write produces a [`MutationEvent`]. Inside a transaction
//! events are buffered and handed to the subscriber sink only when the
//! outermost transaction commits; a rollback discards them.

pub mod ddl;
pub mod query;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use lattice_engine::{
    infer_row, Collection, EncodedField, EncodedRow, IncludeClause, Meta, MonotonicClock,
    Mutation, MutationEvent, Procedure, Query, Schema,
};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::mpsc;

use query::{CompiledQuery, QueryCompiler, SqlArg};

/// Storage errors. Losing a merge is not one of them: a write whose every
/// field loses LWW returns the surviving row unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Engine(#[from] lattice_engine::Error),

    #[error("row not found: {resource}/{id}")]
    RowNotFound { resource: String, id: String },

    #[error("unsupported procedure: {0}")]
    UnsupportedProcedure(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Sink receiving committed mutation events, in commit order.
pub type MutationSink = mpsc::UnboundedSender<MutationEvent>;

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// The post-merge inferred row.
    pub row: Value,
    /// Primary key of the affected row.
    pub resource_id: String,
    /// The mutation record, when at least one field won the merge.
    pub mutation: Option<Mutation>,
    /// The surviving value of every field the write touched, whether the
    /// write won it or lost it. This is what the originator needs to
    /// reconcile its optimistic state.
    pub ack: EncodedRow,
}

/// The storage engine for one schema.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
    schema: Arc<Schema>,
    sink: Option<MutationSink>,
    clock: Arc<Mutex<MonotonicClock>>,
}

impl Storage {
    /// Storage over an already-projected database. Use [`Storage::init`] to
    /// also create missing tables and columns.
    pub fn new(pool: PgPool, schema: Schema, sink: Option<MutationSink>) -> Self {
        Self {
            pool,
            schema: Arc::new(schema),
            sink,
            clock: Arc::new(Mutex::new(MonotonicClock::new())),
        }
    }

    /// Initialize storage: create missing tables and columns, create
    /// indexes, warn on type mismatches. Never drops anything. Fatal on
    /// table/column failures.
    pub async fn init(
        pool: PgPool,
        schema: Schema,
        sink: Option<MutationSink>,
    ) -> Result<Self, StorageError> {
        let plans = ddl::plan_schema(&pool, &schema).await?;
        for plan in &plans {
            if !plan.is_empty() {
                tracing::info!(
                    collection = %plan.collection,
                    statements = plan.statements.len(),
                    indexes = plan.index_statements.len(),
                    "projecting collection to storage"
                );
            }
            ddl::apply_plan(&pool, plan).await?;
        }

        Ok(Self::new(pool, schema, sink))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a relational query over a collection.
    ///
    /// Reads are retried once on transient connection failures.
    pub async fn find(&self, resource: &str, query: &Query) -> Result<Vec<Value>, StorageError> {
        let collection = self.schema.expect_collection(resource)?;
        let compiled = QueryCompiler::new(&self.schema).compile_find(collection, query)?;
        self.fetch_rows(&compiled).await
    }

    /// Fetch a single row by primary key, with optional includes.
    pub async fn find_one(
        &self,
        resource: &str,
        id: &str,
        include: Option<&IncludeClause>,
    ) -> Result<Option<Value>, StorageError> {
        let collection = self.schema.expect_collection(resource)?;
        let compiled = QueryCompiler::new(&self.schema).compile_find_one(collection, id, include)?;
        Ok(self.fetch_rows(&compiled).await?.into_iter().next())
    }

    /// Fetch the full materialized form of a row: `{field: {value, _meta}}`.
    pub async fn raw_find_by_id(
        &self,
        resource: &str,
        id: &str,
    ) -> Result<Option<EncodedRow>, StorageError> {
        let collection = self.schema.expect_collection(resource)?;

        let value_q = QueryCompiler::new(&self.schema).compile_raw_row(collection, false, id, false);
        let value_row = self.fetch_rows(&value_q).await?.into_iter().next();
        let meta_q = QueryCompiler::new(&self.schema).compile_raw_row(collection, true, id, false);
        let meta_row = self.fetch_rows(&meta_q).await?.into_iter().next();

        Ok(compose_encoded(collection, value_row, meta_row))
    }

    /// Insert a plain row, stamping every field now. Performs an LWW merge
    /// if the row already exists.
    pub async fn insert(
        &self,
        resource: &str,
        value: &Value,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome, StorageError> {
        let mut tx = self.begin().await?;
        let outcome = tx.insert(resource, value, mutation_id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Update fields of an existing row, stamping them now.
    pub async fn update(
        &self,
        resource: &str,
        id: &str,
        value: &Value,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome, StorageError> {
        let mut tx = self.begin().await?;
        let outcome = tx.update(resource, id, value, mutation_id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Apply a caller-encoded mutation (the protocol path: timestamps were
    /// stamped by the submitting client).
    pub async fn apply_encoded(
        &self,
        resource: &str,
        procedure: Procedure,
        payload: EncodedRow,
        resource_id: Option<&str>,
        mutation_id: Option<String>,
        origin: Option<String>,
    ) -> Result<WriteOutcome, StorageError> {
        let mut tx = self.begin().await?;
        let outcome = tx
            .apply_encoded(resource, procedure, payload, resource_id, mutation_id, origin)
            .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Open a transaction.
    pub async fn begin(&self) -> Result<StorageTransaction, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(StorageTransaction {
            tx,
            schema: self.schema.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
            depth: 0,
            events: Vec::new(),
        })
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// Mutation events raised inside are delivered to the sink only after
    /// the commit succeeds.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: for<'t> FnOnce(&'t mut StorageTransaction) -> BoxFuture<'t, Result<T, StorageError>>,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                tx.rollback().await?;
                Err(error)
            }
        }
    }

    async fn fetch_rows(&self, compiled: &CompiledQuery) -> Result<Vec<Value>, StorageError> {
        match self.try_fetch(compiled).await {
            Err(error) if is_transient(&error) => {
                tracing::warn!(%error, "transient read failure, retrying once");
                self.try_fetch(compiled).await.map_err(Into::into)
            }
            other => other.map_err(Into::into),
        }
    }

    async fn try_fetch(&self, compiled: &CompiledQuery) -> Result<Vec<Value>, sqlx::Error> {
        let rows = bind_args(&compiled.sql, &compiled.args)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row.try_get("row")).collect()
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

/// An open storage transaction. Dropping it without committing rolls back
/// and discards buffered mutation events.
pub struct StorageTransaction {
    tx: Transaction<'static, Postgres>,
    schema: Arc<Schema>,
    sink: Option<MutationSink>,
    clock: Arc<Mutex<MonotonicClock>>,
    depth: u32,
    events: Vec<MutationEvent>,
}

impl StorageTransaction {
    /// Insert a plain row, stamped now.
    pub async fn insert(
        &mut self,
        resource: &str,
        value: &Value,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome, StorageError> {
        let schema = self.schema.clone();
        let collection = schema.expect_collection(resource)?;
        let payload = collection.encode_row(value, &self.stamp())?;
        self.apply(collection, Procedure::Insert, payload, None, mutation_id, None)
            .await
    }

    /// Update fields of an existing row, stamped now.
    pub async fn update(
        &mut self,
        resource: &str,
        id: &str,
        value: &Value,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome, StorageError> {
        let schema = self.schema.clone();
        let collection = schema.expect_collection(resource)?;
        let payload = collection.encode_row(value, &self.stamp())?;
        self.apply(
            collection,
            Procedure::Update,
            payload,
            Some(id),
            mutation_id,
            None,
        )
        .await
    }

    /// Apply a caller-encoded mutation.
    pub async fn apply_encoded(
        &mut self,
        resource: &str,
        procedure: Procedure,
        payload: EncodedRow,
        resource_id: Option<&str>,
        mutation_id: Option<String>,
        origin: Option<String>,
    ) -> Result<WriteOutcome, StorageError> {
        let schema = self.schema.clone();
        let collection = schema.expect_collection(resource)?;
        self.apply(collection, procedure, payload, resource_id, mutation_id, origin)
            .await
    }

    /// Open a savepoint and run `f` inside it. `Ok` releases the savepoint,
    /// `Err` rolls back to it and discards the inner mutation events; the
    /// outer transaction stays open either way.
    pub async fn nested<T, F>(&mut self, f: F) -> Result<T, StorageError>
    where
        F: for<'t> FnOnce(&'t mut StorageTransaction) -> BoxFuture<'t, Result<T, StorageError>>,
    {
        let savepoint = format!("lattice_sp_{}", self.depth);
        sqlx::query(&format!("SAVEPOINT {savepoint}"))
            .execute(&mut *self.tx)
            .await?;
        self.depth += 1;
        let mark = self.events.len();

        let result = f(&mut *self).await;
        self.depth -= 1;

        match result {
            Ok(value) => {
                sqlx::query(&format!("RELEASE SAVEPOINT {savepoint}"))
                    .execute(&mut *self.tx)
                    .await?;
                Ok(value)
            }
            Err(error) => {
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                    .execute(&mut *self.tx)
                    .await?;
                self.events.truncate(mark);
                Err(error)
            }
        }
    }

    /// Commit and hand buffered mutation events to the sink in order.
    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        if let Some(sink) = &self.sink {
            for event in self.events {
                // A closed sink means nobody is fanning out; not a write error.
                let _ = sink.send(event);
            }
        }
        Ok(())
    }

    /// Roll back and discard buffered mutation events.
    pub async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn stamp(&self) -> String {
        let mut clock = self.clock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clock.stamp(Utc::now())
    }

    async fn apply(
        &mut self,
        collection: &Collection,
        procedure: Procedure,
        payload: EncodedRow,
        resource_id: Option<&str>,
        mutation_id: Option<String>,
        origin: Option<String>,
    ) -> Result<WriteOutcome, StorageError> {
        if matches!(procedure, Procedure::Delete) {
            return Err(StorageError::UnsupportedProcedure(
                "DELETE is reserved and not implemented".into(),
            ));
        }

        let pk = collection.primary_field();
        let from_payload = payload
            .get(pk)
            .and_then(|field| field.value.as_str())
            .map(str::to_string);
        let id = match procedure {
            Procedure::Insert => from_payload.or_else(|| resource_id.map(str::to_string)),
            _ => resource_id.map(str::to_string).or(from_payload),
        }
        .ok_or_else(|| {
            StorageError::InvalidRow(format!(
                "mutation on '{}' carries no value for primary field '{pk}'",
                collection.name
            ))
        })?;

        let current = self.raw_row(collection, &id, true).await?;
        if matches!(procedure, Procedure::Update) && current.is_none() {
            return Err(StorageError::RowNotFound {
                resource: collection.name.clone(),
                id,
            });
        }

        let touched: Vec<String> = payload.keys().cloned().collect();
        let merge = collection.merge_row(payload, current.as_ref());
        for field in &merge.passed_through {
            tracing::warn!(
                resource = %collection.name,
                field = %field,
                "unknown field passed through merge; fanned out but not persisted"
            );
        }

        let inferred = infer_row(&merge.materialized);
        let ack: EncodedRow = touched
            .iter()
            .filter_map(|name| {
                merge
                    .materialized
                    .get(name)
                    .map(|field| (name.clone(), field.clone()))
            })
            .collect();

        let Some(accepted) = merge.accepted else {
            // Every field lost LWW: the surviving row is the result, no
            // event is raised.
            return Ok(WriteOutcome {
                row: inferred,
                resource_id: id,
                mutation: None,
                ack,
            });
        };

        let (value_q, meta_q) =
            QueryCompiler::new(&self.schema).compile_upsert(collection, &id, &accepted)?;
        bind_args(&value_q.sql, &value_q.args)
            .execute(&mut *self.tx)
            .await?;
        bind_args(&meta_q.sql, &meta_q.args)
            .execute(&mut *self.tx)
            .await?;

        let mutation = Mutation {
            id: uuid::Uuid::new_v4().to_string(),
            resource: collection.name.clone(),
            resource_id: id.clone(),
            procedure,
            payload: accepted,
            mutation_id,
        };
        self.events.push(MutationEvent {
            mutation: mutation.clone(),
            row: inferred.clone(),
            origin,
        });

        Ok(WriteOutcome {
            row: inferred,
            resource_id: id,
            mutation: Some(mutation),
            ack,
        })
    }

    /// Read the materialized row inside this transaction, locking the value
    /// row when `lock` is set.
    async fn raw_row(
        &mut self,
        collection: &Collection,
        id: &str,
        lock: bool,
    ) -> Result<Option<EncodedRow>, StorageError> {
        let value_q = QueryCompiler::new(&self.schema).compile_raw_row(collection, false, id, lock);
        let value_row = bind_args(&value_q.sql, &value_q.args)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(|row| row.try_get::<Value, _>("row"))
            .transpose()?;

        let meta_q = QueryCompiler::new(&self.schema).compile_raw_row(collection, true, id, false);
        let meta_row = bind_args(&meta_q.sql, &meta_q.args)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(|row| row.try_get::<Value, _>("row"))
            .transpose()?;

        Ok(compose_encoded(collection, value_row, meta_row))
    }
}

/// Zip a value row and its meta row into the materialized form.
///
/// A field appears when its meta stamp is present or its value is non-null;
/// a value without a stamp (rows written outside the runtime) gets empty
/// metadata and loses to any stamped write.
fn compose_encoded(
    collection: &Collection,
    value_row: Option<Value>,
    meta_row: Option<Value>,
) -> Option<EncodedRow> {
    let value_obj = match value_row {
        Some(Value::Object(obj)) => obj,
        _ => return None,
    };
    let meta_obj = match meta_row {
        Some(Value::Object(obj)) => obj,
        _ => serde_json::Map::new(),
    };

    let pk = collection.primary_field();
    let mut encoded = EncodedRow::new();
    for name in collection.fields.keys() {
        let value = value_obj.get(name).cloned().unwrap_or(Value::Null);
        let meta_column = if name == pk {
            format!("{pk}_ts")
        } else {
            name.clone()
        };
        let stamp = meta_obj
            .get(&meta_column)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match stamp {
            Some(stamp) => {
                encoded.insert(name.clone(), EncodedField::new(value, stamp));
            }
            None if !value.is_null() => {
                encoded.insert(
                    name.clone(),
                    EncodedField {
                        value,
                        meta: Meta::default(),
                    },
                );
            }
            None => {}
        }
    }
    Some(encoded)
}

fn bind_args<'q>(
    sql: &'q str,
    args: &'q [SqlArg],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = match arg {
            SqlArg::Text(v) => query.bind(v.clone()),
            SqlArg::Float(v) => query.bind(*v),
            SqlArg::Bool(v) => query.bind(*v),
            SqlArg::Json(v) => query.bind(v.clone()),
            SqlArg::Timestamp(v) => query.bind(*v),
        };
    }
    query
}
