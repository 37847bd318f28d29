//! Additive schema projection.
//!
//! `init` creates missing tables, adds missing columns, and creates indexes.
//! It never drops or alters existing columns: a declared type that disagrees
//! with the live column produces a warning and the column is left alone.
//! The same planner backs the migration CLI, which is why planning is pure
//! and introspection is separate.

use lattice_engine::{Collection, Schema, SqlType};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use super::query::meta_table_name;
use super::StorageError;

/// Introspected state of one table.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub exists: bool,
    /// `column name -> information_schema data_type`
    pub columns: HashMap<String, String>,
}

/// The DDL plan for one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionPlan {
    pub collection: String,
    /// Table/column statements, applied in order; failures are fatal.
    pub statements: Vec<String>,
    /// Index statements; failures are logged and skipped.
    pub index_statements: Vec<String>,
    /// Declared/live type disagreements, reported but never acted on.
    pub warnings: Vec<String>,
}

impl CollectionPlan {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.index_statements.is_empty()
    }
}

/// Plan the additive DDL for one collection given the live table state.
pub fn plan_collection(
    collection: &Collection,
    value_table: &TableInfo,
    meta_table: &TableInfo,
) -> CollectionPlan {
    let mut plan = CollectionPlan {
        collection: collection.name.clone(),
        ..CollectionPlan::default()
    };

    let table = &collection.name;
    let pk = collection.primary_field();

    if !value_table.exists {
        let mut defs = vec![format!("\"{pk}\" varchar PRIMARY KEY")];
        for (name, field) in &collection.fields {
            if name == pk {
                continue;
            }
            defs.push(column_def(name, field));
        }
        plan.statements
            .push(format!("CREATE TABLE \"{table}\" ({})", defs.join(", ")));
    } else {
        for (name, field) in &collection.fields {
            if name == pk {
                continue;
            }
            let storage = field.storage_field_type();
            match value_table.columns.get(name) {
                None => plan.statements.push(format!(
                    "ALTER TABLE \"{table}\" ADD COLUMN {}",
                    column_def(name, field)
                )),
                Some(live) if !storage.sql_type.matches_data_type(live) => {
                    plan.warnings.push(format!(
                        "column {table}.{name} is '{live}' but schema declares '{}'; leaving it alone",
                        storage.sql_type.ddl()
                    ));
                }
                Some(_) => {}
            }
        }
    }

    // Indexes and unique constraints; IF NOT EXISTS keeps re-runs additive.
    for (name, field) in &collection.fields {
        let storage = field.storage_field_type();
        if storage.unique && name != pk {
            plan.index_statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"{table}_{name}_unique\" ON \"{table}\" (\"{name}\")"
            ));
        }
        if storage.index {
            plan.index_statements.push(format!(
                "CREATE INDEX IF NOT EXISTS \"{table}_{name}_index\" ON \"{table}\" (\"{name}\")"
            ));
        }
    }

    // Parallel per-field timestamp table: the row id as join key, the
    // primary field's own stamp under "<pk>_ts", every other field under
    // its own name. All varchar.
    let meta_name = meta_table_name(table);
    let mut meta_columns: Vec<String> = vec![format!("{pk}_ts")];
    meta_columns.extend(
        collection
            .fields
            .keys()
            .filter(|name| name.as_str() != pk)
            .cloned(),
    );

    if !meta_table.exists {
        let mut defs = vec![format!("\"{pk}\" varchar PRIMARY KEY")];
        for column in &meta_columns {
            defs.push(format!("\"{column}\" varchar"));
        }
        plan.statements.push(format!(
            "CREATE TABLE \"{meta_name}\" ({})",
            defs.join(", ")
        ));
    } else {
        for column in &meta_columns {
            if !meta_table.columns.contains_key(column) {
                plan.statements.push(format!(
                    "ALTER TABLE \"{meta_name}\" ADD COLUMN \"{column}\" varchar"
                ));
            }
        }
    }

    plan
}

fn column_def(name: &str, field: &lattice_engine::FieldType) -> String {
    let storage = field.storage_field_type();
    let mut def = format!("\"{name}\" {}", storage.sql_type.ddl());
    if let Some(default) = &storage.default {
        def.push_str(&format!(" DEFAULT {}", sql_literal(default, storage.sql_type)));
    }
    if let (Some(values), Some(enum_name)) = (&storage.enum_values, &storage.enum_name) {
        let members: Vec<String> = values
            .iter()
            .map(|v| format!("'{}'", v.replace('\'', "''")))
            .collect();
        def.push_str(&format!(
            " CONSTRAINT \"{enum_name}\" CHECK (\"{name}\" IN ({}))",
            members.join(", ")
        ));
    }
    if let Some(reference) = &storage.references {
        def.push_str(&format!(
            " REFERENCES \"{}\" (\"{}\")",
            reference.collection, reference.field
        ));
    }
    def
}

fn sql_literal(value: &serde_json::Value, sql_type: SqlType) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            let raw = match other {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let escaped = raw.replace('\'', "''");
            match sql_type {
                SqlType::Jsonb => format!("'{escaped}'::jsonb"),
                _ => format!("'{escaped}'"),
            }
        }
    }
}

/// Introspect the live state of a table.
pub async fn introspect(pool: &PgPool, table: &str) -> Result<TableInfo, StorageError> {
    let rows = sqlx::query(
        "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(TableInfo::default());
    }

    let mut columns = HashMap::new();
    for row in rows {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        columns.insert(name, data_type);
    }
    Ok(TableInfo {
        exists: true,
        columns,
    })
}

/// Plan the full schema against the live database.
pub async fn plan_schema(pool: &PgPool, schema: &Schema) -> Result<Vec<CollectionPlan>, StorageError> {
    let mut plans = Vec::new();
    for collection in schema.collections.values() {
        let value_table = introspect(pool, &collection.name).await?;
        let meta_table = introspect(pool, &meta_table_name(&collection.name)).await?;
        plans.push(plan_collection(collection, &value_table, &meta_table));
    }
    Ok(plans)
}

/// Apply a plan. Table/column failures abort; index failures are logged and
/// skipped.
pub async fn apply_plan(pool: &PgPool, plan: &CollectionPlan) -> Result<(), StorageError> {
    for warning in &plan.warnings {
        tracing::warn!(collection = %plan.collection, "{warning}");
    }
    for statement in &plan.statements {
        tracing::debug!(collection = %plan.collection, sql = %statement, "applying DDL");
        sqlx::query(statement).execute(pool).await?;
    }
    for statement in &plan.index_statements {
        if let Err(error) = sqlx::query(statement).execute(pool).await {
            tracing::warn!(
                collection = %plan.collection,
                sql = %statement,
                %error,
                "index creation failed, skipping"
            );
        }
    }
    Ok(())
}
