//! Query compiler: where/include clauses to joined SQL.
//!
//! One `find` compiles to a single statement of the shape
//!
//! ```sql
//! SELECT row_to_json(q) AS row FROM (
//!     SELECT "posts".*, <include subselects>
//!     FROM "posts"
//!     <LEFT JOINs for to-one traversals>
//!     WHERE <predicate>
//!     ORDER BY ... LIMIT ...
//! ) q
//! ```
//!
//! To-one relation traversals in the where-clause become LEFT JOINs aliased
//! by the target collection name, in depth-first order of the clause tree.
//! To-many traversals become correlated `EXISTS (SELECT 1 ...)` subqueries.
//! Includes become aggregated JSON subselects aliased as the relation name,
//! so every row decodes as one JSON object with its joined shape embedded.

use chrono::{DateTime, Utc};
use lattice_engine::{
    extract_include_from_where, Collection, CompareOps, EncodedRow, Error as EngineError,
    FieldCondition, FieldKind, FieldType, IncludeClause, IncludeSpec, NotCondition, OrderBy,
    Query, RelationKind, Schema, SubQuery, WhereClause,
};
use serde_json::Value;

use super::StorageError;

/// A bind argument for a compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Text(String),
    Float(f64),
    Bool(bool),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

/// A compiled SQL statement with its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

/// Compiles queries for one schema.
pub struct QueryCompiler<'a> {
    schema: &'a Schema,
    args: Vec<SqlArg>,
    seq: usize,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            args: Vec::new(),
            seq: 0,
        }
    }

    /// Compile a full `find` over `collection`.
    pub fn compile_find(
        mut self,
        collection: &Collection,
        query: &Query,
    ) -> Result<CompiledQuery, StorageError> {
        query.validate(self.schema, collection)?;

        // Relations the where-clause touches are implicitly included so the
        // returned rows carry the joined data the predicate needed.
        let implicit = query
            .where_clause
            .as_ref()
            .map(extract_include_from_where)
            .unwrap_or_default();
        let include = match &query.include {
            Some(user) => user.clone().merge(implicit),
            None => implicit,
        };

        let base = &collection.name;
        let mut joins = Vec::new();
        let where_sql = match &query.where_clause {
            Some(clause) => Some(self.compile_where(collection, base, clause, false, &mut joins)?),
            None => None,
        };
        let include_selects = self.compile_includes(collection, base, &include)?;

        let mut select_list = format!("\"{base}\".*");
        for select in &include_selects {
            select_list.push_str(", ");
            select_list.push_str(select);
        }

        let mut inner = format!("SELECT {select_list} FROM \"{base}\"");
        for join in &joins {
            inner.push(' ');
            inner.push_str(join);
        }
        if let Some(predicate) = where_sql {
            inner.push_str(&format!(" WHERE {predicate}"));
        }
        if let Some(order_by) = &query.order_by {
            inner.push_str(&order_by_sql(base, order_by));
        }
        if let Some(limit) = query.limit {
            inner.push_str(&format!(" LIMIT {limit}"));
        }

        Ok(CompiledQuery {
            sql: format!("SELECT row_to_json(q) AS row FROM ({inner}) q"),
            args: self.args,
        })
    }

    /// Compile a `find_one` by primary key, with optional includes.
    pub fn compile_find_one(
        self,
        collection: &Collection,
        id: &str,
        include: Option<&IncludeClause>,
    ) -> Result<CompiledQuery, StorageError> {
        let pk = collection.primary_field().to_string();
        let by_id = WhereClause::Fields(
            [(pk, FieldCondition::Equals(Value::String(id.to_string())))]
                .into_iter()
                .collect(),
        );
        let query = Query {
            where_clause: Some(by_id),
            include: include.cloned(),
            order_by: None,
            limit: Some(1),
        };
        self.compile_find(collection, &query)
    }

    /// Compile the raw single-row read used by the merge path: one row of
    /// either the value table or the meta table, as JSON, optionally locked.
    pub fn compile_raw_row(
        mut self,
        collection: &Collection,
        meta_table: bool,
        id: &str,
        for_update: bool,
    ) -> CompiledQuery {
        let table = if meta_table {
            meta_table_name(&collection.name)
        } else {
            collection.name.clone()
        };
        let pk = collection.primary_field();
        let placeholder = self.push_arg(SqlArg::Text(id.to_string()));
        let lock = if for_update { " FOR UPDATE" } else { "" };

        CompiledQuery {
            sql: format!(
                "SELECT row_to_json(q) AS row FROM \
                 (SELECT \"{table}\".* FROM \"{table}\" WHERE \"{table}\".\"{pk}\" = {placeholder}{lock}) q"
            ),
            args: self.args,
        }
    }

    /// Compile the pair of upserts persisting an accepted diff: declared
    /// columns into the value table, their timestamps into the meta table.
    ///
    /// Fields in the diff without a declared column (forward-compat
    /// pass-through) are skipped; the caller decides whether to surface them.
    pub fn compile_upsert(
        self,
        collection: &Collection,
        id: &str,
        accepted: &EncodedRow,
    ) -> Result<(CompiledQuery, CompiledQuery), StorageError> {
        let pk = collection.primary_field().to_string();

        let mut columns: Vec<&str> = Vec::new();
        for name in accepted.keys() {
            if *name != pk && collection.field(name).is_some() {
                columns.push(name);
            }
        }

        let mut value_args = Vec::new();
        let mut value_placeholders = vec![bind(&mut value_args, SqlArg::Text(id.to_string()))];
        for name in &columns {
            let field = collection
                .field(name)
                .expect("columns filtered to declared fields");
            let encoded = &accepted[*name];
            if encoded.value.is_null() {
                value_placeholders.push("NULL".to_string());
            } else {
                value_placeholders.push(bind(&mut value_args, storage_arg(field, name, &encoded.value)?));
            }
        }

        let mut meta_args = Vec::new();
        let mut meta_placeholders = vec![bind(&mut meta_args, SqlArg::Text(id.to_string()))];
        for name in &columns {
            match &accepted[*name].meta.timestamp {
                Some(stamp) => {
                    meta_placeholders.push(bind(&mut meta_args, SqlArg::Text(stamp.clone())))
                }
                None => meta_placeholders.push("NULL".to_string()),
            }
        }
        // The primary key's stamp rides along when the diff carries it.
        if let Some(pk_field) = accepted.get(&pk) {
            if let Some(stamp) = &pk_field.meta.timestamp {
                let placeholder = bind(&mut meta_args, SqlArg::Text(stamp.clone()));
                meta_placeholders.push(placeholder);
            }
        }

        let column_list = |names: &[&str], with_pk_stamp: bool| {
            let mut list = vec![format!("\"{pk}\"")];
            list.extend(names.iter().map(|n| format!("\"{n}\"")));
            if with_pk_stamp {
                list.push(format!("\"{pk}_ts\""));
            }
            list.join(", ")
        };

        let conflict_update = |names: &[&str], extra: &[&str]| {
            let assignments: Vec<String> = names
                .iter()
                .copied()
                .chain(extra.iter().copied())
                .map(|n| format!("\"{n}\" = EXCLUDED.\"{n}\""))
                .collect();
            if assignments.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", assignments.join(", "))
            }
        };

        let table = &collection.name;
        let value_sql = format!(
            "INSERT INTO \"{table}\" ({}) VALUES ({}) ON CONFLICT (\"{pk}\") {}",
            column_list(&columns, false),
            value_placeholders.join(", "),
            conflict_update(&columns, &[]),
        );

        let meta_table = meta_table_name(table);
        let pk_stamped = accepted
            .get(&pk)
            .map(|f| f.meta.timestamp.is_some())
            .unwrap_or(false);
        let pk_ts_col = format!("{pk}_ts");
        let meta_extra: Vec<&str> = if pk_stamped {
            vec![pk_ts_col.as_str()]
        } else {
            vec![]
        };
        let meta_sql = format!(
            "INSERT INTO \"{meta_table}\" ({}) VALUES ({}) ON CONFLICT (\"{pk}\") {}",
            column_list(&columns, pk_stamped),
            meta_placeholders.join(", "),
            conflict_update(&columns, &meta_extra),
        );

        Ok((
            CompiledQuery {
                sql: value_sql,
                args: value_args,
            },
            CompiledQuery {
                sql: meta_sql,
                args: meta_args,
            },
        ))
    }

    fn push_arg(&mut self, arg: SqlArg) -> String {
        self.args.push(arg);
        format!("${}", self.args.len())
    }

    fn compile_where(
        &mut self,
        collection: &Collection,
        alias: &str,
        clause: &WhereClause,
        negated: bool,
        joins: &mut Vec<String>,
    ) -> Result<String, StorageError> {
        match clause {
            WhereClause::And(branches) | WhereClause::Or(branches) => {
                let glue = if matches!(clause, WhereClause::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let mut parts = Vec::with_capacity(branches.len());
                for branch in branches {
                    let sql = self.compile_where(collection, alias, branch, negated, joins)?;
                    parts.push(format!("({sql})"));
                }
                Ok(if parts.is_empty() {
                    "TRUE".to_string()
                } else {
                    parts.join(glue)
                })
            }
            WhereClause::Fields(fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                for (name, condition) in fields {
                    parts.push(self.compile_condition(
                        collection, alias, name, condition, negated, joins,
                    )?);
                }
                Ok(if parts.is_empty() {
                    "TRUE".to_string()
                } else {
                    parts.join(" AND ")
                })
            }
        }
    }

    fn compile_condition(
        &mut self,
        collection: &Collection,
        alias: &str,
        name: &str,
        condition: &FieldCondition,
        negated: bool,
        joins: &mut Vec<String>,
    ) -> Result<String, StorageError> {
        match condition {
            FieldCondition::Equals(Value::Null) => Ok(format!("\"{alias}\".\"{name}\" IS NULL")),
            FieldCondition::Equals(value) => {
                let field = expect_field(collection, name)?;
                let placeholder = self.push_arg(storage_arg(field, name, value)?);
                Ok(format!("\"{alias}\".\"{name}\" = {placeholder}"))
            }
            FieldCondition::Ops(ops) => {
                let field = expect_field(collection, name)?;
                self.compile_ops(field, alias, name, ops)
            }
            FieldCondition::Related(nested) => {
                let relation = collection.relation(name).ok_or_else(|| {
                    EngineError::UnknownField {
                        collection: collection.name.clone(),
                        field: name.to_string(),
                    }
                })?;
                let target = self.schema.expect_collection(&relation.target)?;

                match relation.kind {
                    RelationKind::One => {
                        let local = relation.relational_column.as_deref().ok_or_else(|| {
                            EngineError::InvalidClause(format!(
                                "relation '{name}' has no relational column"
                            ))
                        })?;
                        let target_name = &target.name;
                        let target_pk = target.primary_field();
                        let join = format!(
                            "LEFT JOIN \"{target_name}\" ON \"{target_name}\".\"{target_pk}\" = \"{alias}\".\"{local}\""
                        );
                        if !joins.contains(&join) {
                            joins.push(join);
                        }
                        self.compile_where(target, target_name, nested, negated, joins)
                    }
                    RelationKind::Many => {
                        let foreign = relation.foreign_column.as_deref().ok_or_else(|| {
                            EngineError::InvalidClause(format!(
                                "relation '{name}' has no foreign column"
                            ))
                        })?;
                        let target_name = &target.name;
                        let parent_pk = collection.primary_field();

                        let mut inner_joins = Vec::new();
                        let inner =
                            self.compile_where(target, target_name, nested, false, &mut inner_joins)?;
                        let mut from = format!("\"{target_name}\"");
                        for join in inner_joins {
                            from.push(' ');
                            from.push_str(&join);
                        }

                        let keyword = if negated { "NOT EXISTS" } else { "EXISTS" };
                        Ok(format!(
                            "{keyword} (SELECT 1 FROM {from} WHERE \
                             \"{target_name}\".\"{foreign}\" = \"{alias}\".\"{parent_pk}\" AND {inner})"
                        ))
                    }
                }
            }
        }
    }

    fn compile_ops(
        &mut self,
        field: &FieldType,
        alias: &str,
        name: &str,
        ops: &CompareOps,
    ) -> Result<String, StorageError> {
        let column = format!("\"{alias}\".\"{name}\"");
        let mut parts = Vec::new();

        if let Some(value) = &ops.eq {
            parts.push(if value.is_null() {
                format!("{column} IS NULL")
            } else {
                let placeholder = self.push_arg(storage_arg(field, name, value)?);
                format!("{column} = {placeholder}")
            });
        }

        if let Some(list) = &ops.within {
            parts.push(self.compile_in(field, &column, name, list, false)?);
        }

        if let Some(not) = ops.not.as_deref() {
            parts.push(match not {
                NotCondition::Equals(Value::Null) => format!("{column} IS NOT NULL"),
                NotCondition::Equals(value) => {
                    let placeholder = self.push_arg(storage_arg(field, name, value)?);
                    format!("{column} <> {placeholder}")
                }
                NotCondition::Ops(inner) => {
                    if let (Some(list), true) = (
                        &inner.within,
                        inner.eq.is_none()
                            && inner.not.is_none()
                            && inner.gt.is_none()
                            && inner.gte.is_none()
                            && inner.lt.is_none()
                            && inner.lte.is_none(),
                    ) {
                        self.compile_in(field, &column, name, list, true)?
                    } else {
                        let inner_sql = self.compile_ops(field, alias, name, inner)?;
                        format!("NOT ({inner_sql})")
                    }
                }
            });
        }

        for (operator, bound) in [
            (">", &ops.gt),
            (">=", &ops.gte),
            ("<", &ops.lt),
            ("<=", &ops.lte),
        ] {
            if let Some(value) = bound {
                let placeholder = self.push_arg(storage_arg(field, name, value)?);
                parts.push(format!("{column} {operator} {placeholder}"));
            }
        }

        Ok(parts.join(" AND "))
    }

    fn compile_in(
        &mut self,
        field: &FieldType,
        column: &str,
        name: &str,
        list: &[Value],
        negated: bool,
    ) -> Result<String, StorageError> {
        if list.is_empty() {
            // `x IN ()` is not SQL; an empty list matches nothing.
            return Ok(if negated { "TRUE" } else { "FALSE" }.to_string());
        }
        let mut placeholders = Vec::with_capacity(list.len());
        for value in list {
            placeholders.push(self.push_arg(storage_arg(field, name, value)?));
        }
        let keyword = if negated { "NOT IN" } else { "IN" };
        Ok(format!("{column} {keyword} ({})", placeholders.join(", ")))
    }

    fn compile_includes(
        &mut self,
        collection: &Collection,
        alias: &str,
        include: &IncludeClause,
    ) -> Result<Vec<String>, StorageError> {
        let mut selects = Vec::new();

        for (rel_name, spec) in &include.0 {
            let relation = collection.relation(rel_name).ok_or_else(|| {
                EngineError::UnknownField {
                    collection: collection.name.clone(),
                    field: rel_name.clone(),
                }
            })?;
            let target = self.schema.expect_collection(&relation.target)?;

            self.seq += 1;
            let t_alias = format!("t{}", self.seq);
            let row_alias = format!("{t_alias}_row");

            let sub = match spec {
                IncludeSpec::All => SubQuery::default(),
                IncludeSpec::Query(sub) => sub.clone(),
            };

            // Nested includes: explicit plus those implied by the sub-where.
            let implicit = sub
                .where_clause
                .as_ref()
                .map(extract_include_from_where)
                .unwrap_or_default();
            let nested_include = match sub.include {
                Some(explicit) => explicit.merge(implicit),
                None => implicit,
            };
            let nested_selects = self.compile_includes(target, &t_alias, &nested_include)?;

            let correlation = match relation.kind {
                RelationKind::One => {
                    let local = relation.relational_column.as_deref().ok_or_else(|| {
                        EngineError::InvalidClause(format!(
                            "relation '{rel_name}' has no relational column"
                        ))
                    })?;
                    let target_pk = target.primary_field();
                    format!("\"{t_alias}\".\"{target_pk}\" = \"{alias}\".\"{local}\"")
                }
                RelationKind::Many => {
                    let foreign = relation.foreign_column.as_deref().ok_or_else(|| {
                        EngineError::InvalidClause(format!(
                            "relation '{rel_name}' has no foreign column"
                        ))
                    })?;
                    let parent_pk = collection.primary_field();
                    format!("\"{t_alias}\".\"{foreign}\" = \"{alias}\".\"{parent_pk}\"")
                }
            };

            let mut select_list = format!("\"{t_alias}\".*");
            for nested in &nested_selects {
                select_list.push_str(", ");
                select_list.push_str(nested);
            }

            let mut sub_joins = Vec::new();
            let sub_where = match &sub.where_clause {
                Some(clause) => {
                    Some(self.compile_where(target, &t_alias, clause, false, &mut sub_joins)?)
                }
                None => None,
            };

            let target_name = &target.name;
            let mut inner =
                format!("SELECT {select_list} FROM \"{target_name}\" AS \"{t_alias}\"");
            for join in sub_joins {
                inner.push(' ');
                inner.push_str(&join);
            }
            inner.push_str(&format!(" WHERE {correlation}"));
            if let Some(predicate) = sub_where {
                inner.push_str(&format!(" AND ({predicate})"));
            }
            if let Some(order_by) = &sub.order_by {
                inner.push_str(&order_by_sql(&t_alias, order_by));
            }
            if let Some(limit) = sub.limit {
                inner.push_str(&format!(" LIMIT {limit}"));
            }

            let select = match relation.kind {
                RelationKind::One => format!(
                    "(SELECT row_to_json(\"{row_alias}\") FROM ({inner}) \"{row_alias}\") AS \"{rel_name}\""
                ),
                RelationKind::Many => format!(
                    "(SELECT COALESCE(json_agg(row_to_json(\"{row_alias}\")), '[]'::json) \
                     FROM ({inner}) \"{row_alias}\") AS \"{rel_name}\""
                ),
            };
            selects.push(select);
        }

        Ok(selects)
    }
}

/// The name of a collection's parallel per-field timestamp table.
pub fn meta_table_name(collection: &str) -> String {
    format!("{collection}_meta")
}

fn expect_field<'c>(collection: &'c Collection, name: &str) -> Result<&'c FieldType, StorageError> {
    collection.field(name).ok_or_else(|| {
        StorageError::Engine(EngineError::UnknownField {
            collection: collection.name.clone(),
            field: name.to_string(),
        })
    })
}

fn bind(args: &mut Vec<SqlArg>, arg: SqlArg) -> String {
    args.push(arg);
    format!("${}", args.len())
}

/// Convert a clause or row value to a bind argument per the field's type.
fn storage_arg(field: &FieldType, name: &str, value: &Value) -> Result<SqlArg, StorageError> {
    let invalid = |got: &str| {
        StorageError::Engine(EngineError::InvalidValue {
            field: name.to_string(),
            expected: format!("{}", field.kind),
            got: got.to_string(),
        })
    };

    Ok(match &field.kind {
        FieldKind::Number => SqlArg::Float(value.as_f64().ok_or_else(|| invalid("non-number"))?),
        FieldKind::Boolean => SqlArg::Bool(value.as_bool().ok_or_else(|| invalid("non-boolean"))?),
        FieldKind::Timestamp => {
            let raw = value.as_str().ok_or_else(|| invalid("non-string"))?;
            let parsed = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| invalid("unparseable timestamp"))?;
            SqlArg::Timestamp(parsed.with_timezone(&Utc))
        }
        FieldKind::Json => SqlArg::Json(value.clone()),
        FieldKind::String | FieldKind::Enum { .. } => {
            SqlArg::Text(value.as_str().ok_or_else(|| invalid("non-string"))?.to_string())
        }
    })
}

fn order_by_sql(alias: &str, order_by: &OrderBy) -> String {
    let keys: Vec<String> = order_by
        .0
        .iter()
        .map(|(field, direction)| {
            let dir = match direction {
                lattice_engine::Direction::Asc => "ASC",
                lattice_engine::Direction::Desc => "DESC",
            };
            format!("\"{alias}\".\"{field}\" {dir}")
        })
        .collect();
    if keys.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", keys.join(", "))
    }
}
