//! Where/include clause model.
//!
//! The clause grammar (JSON):
//!
//! ```text
//! Where  := Field* | { "$and": Where[] } | { "$or": Where[] }
//! Field  := name -> (Scalar | Op | NestedWhere)
//! Op     := { "$eq"?, "$in"?, "$not"?, "$gt"?, "$gte"?, "$lt"?, "$lte"? }
//! Include := { relation -> true | { where?, orderBy?, limit?, include? } }
//! ```
//!
//! Clauses parse from raw JSON, validate against a schema, evaluate in
//! memory against inferred rows (used by subscription fan-out), and
//! serialize back to the same JSON for the wire. The SQL compilation of the
//! same AST lives in the storage back-end.

use crate::error::{Error, Result};
use crate::schema::{Collection, RelationKind, Schema};
use serde_json::Value;
use std::collections::BTreeMap;

/// A parsed where-clause.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    /// Field conditions combined with AND.
    Fields(BTreeMap<String, FieldCondition>),
    And(Vec<WhereClause>),
    Or(Vec<WhereClause>),
}

/// Condition on a single field or relation.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldCondition {
    /// Scalar short form; `null` compiles to IS NULL.
    Equals(Value),
    /// Operator object.
    Ops(CompareOps),
    /// Traversal into a relation's where-space.
    Related(Box<WhereClause>),
}

/// The operator object. Absent operators are `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompareOps {
    pub eq: Option<Value>,
    /// `$in`.
    pub within: Option<Vec<Value>>,
    pub not: Option<Box<NotCondition>>,
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

impl CompareOps {
    fn is_empty(&self) -> bool {
        self.eq.is_none()
            && self.within.is_none()
            && self.not.is_none()
            && self.gt.is_none()
            && self.gte.is_none()
            && self.lt.is_none()
            && self.lte.is_none()
    }
}

/// Operand of `$not`: short form (scalar) or long form (operator object).
#[derive(Debug, Clone, PartialEq)]
pub enum NotCondition {
    Equals(Value),
    Ops(CompareOps),
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// An ordered list of `(field, direction)` sort keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderBy(pub Vec<(String, Direction)>);

/// A parsed include-clause.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IncludeClause(pub BTreeMap<String, IncludeSpec>);

/// What to include for one relation.
#[derive(Debug, Clone, PartialEq)]
pub enum IncludeSpec {
    /// `relation: true`: all related rows, no filter.
    All,
    /// `relation: { ... }`: a filtered/shaped sub-query.
    Query(SubQuery),
}

/// A nested sub-query inside an include.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubQuery {
    pub where_clause: Option<WhereClause>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
    pub include: Option<IncludeClause>,
}

/// A complete query over one collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub where_clause: Option<WhereClause>,
    pub include: Option<IncludeClause>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl WhereClause {
    /// Parse a where-clause from its JSON form.
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidClause("where must be an object".into()))?;

        if obj.contains_key("$and") || obj.contains_key("$or") {
            if obj.len() != 1 {
                return Err(Error::InvalidClause(
                    "$and/$or must be the only key at their level".into(),
                ));
            }
            let (key, branches) = obj.iter().next().expect("len checked");
            let list = branches.as_array().ok_or_else(|| {
                Error::InvalidClause(format!("{key} expects an array of clauses"))
            })?;
            let parsed = list.iter().map(WhereClause::parse).collect::<Result<_>>()?;
            return Ok(match key.as_str() {
                "$and" => WhereClause::And(parsed),
                _ => WhereClause::Or(parsed),
            });
        }

        let mut fields = BTreeMap::new();
        for (key, condition) in obj {
            if key.starts_with('$') {
                return Err(Error::InvalidClause(format!("unknown operator '{key}'")));
            }
            fields.insert(key.clone(), FieldCondition::parse(condition)?);
        }
        Ok(WhereClause::Fields(fields))
    }

    /// Serialize back to the JSON grammar.
    pub fn to_value(&self) -> Value {
        match self {
            WhereClause::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, cond)| (name.clone(), cond.to_value()))
                    .collect(),
            ),
            WhereClause::And(branches) => serde_json::json!({
                "$and": branches.iter().map(WhereClause::to_value).collect::<Vec<_>>()
            }),
            WhereClause::Or(branches) => serde_json::json!({
                "$or": branches.iter().map(WhereClause::to_value).collect::<Vec<_>>()
            }),
        }
    }
}

impl FieldCondition {
    fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Object(obj) => {
                let has_ops = obj.keys().any(|k| k.starts_with('$'));
                if has_ops {
                    Ok(FieldCondition::Ops(CompareOps::parse(value)?))
                } else {
                    Ok(FieldCondition::Related(Box::new(WhereClause::parse(value)?)))
                }
            }
            scalar => Ok(FieldCondition::Equals(scalar.clone())),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            FieldCondition::Equals(v) => v.clone(),
            FieldCondition::Ops(ops) => ops.to_value(),
            FieldCondition::Related(clause) => clause.to_value(),
        }
    }
}

impl CompareOps {
    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidClause("operator object expected".into()))?;

        let mut ops = CompareOps::default();
        for (key, operand) in obj {
            match key.as_str() {
                "$eq" => ops.eq = Some(operand.clone()),
                "$in" => {
                    let list = operand.as_array().ok_or_else(|| {
                        Error::InvalidClause("$in expects an array".into())
                    })?;
                    ops.within = Some(list.clone());
                }
                "$not" => {
                    ops.not = Some(Box::new(match operand {
                        Value::Object(inner) if inner.keys().any(|k| k.starts_with('$')) => {
                            NotCondition::Ops(CompareOps::parse(operand)?)
                        }
                        scalar => NotCondition::Equals(scalar.clone()),
                    }));
                }
                "$gt" => ops.gt = Some(operand.clone()),
                "$gte" => ops.gte = Some(operand.clone()),
                "$lt" => ops.lt = Some(operand.clone()),
                "$lte" => ops.lte = Some(operand.clone()),
                other => {
                    return Err(Error::InvalidClause(format!("unknown operator '{other}'")))
                }
            }
        }
        if ops.is_empty() {
            return Err(Error::InvalidClause("empty operator object".into()));
        }
        Ok(ops)
    }

    fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if let Some(v) = &self.eq {
            obj.insert("$eq".into(), v.clone());
        }
        if let Some(v) = &self.within {
            obj.insert("$in".into(), Value::Array(v.clone()));
        }
        if let Some(not) = &self.not {
            let v = match not.as_ref() {
                NotCondition::Equals(v) => v.clone(),
                NotCondition::Ops(ops) => ops.to_value(),
            };
            obj.insert("$not".into(), v);
        }
        if let Some(v) = &self.gt {
            obj.insert("$gt".into(), v.clone());
        }
        if let Some(v) = &self.gte {
            obj.insert("$gte".into(), v.clone());
        }
        if let Some(v) = &self.lt {
            obj.insert("$lt".into(), v.clone());
        }
        if let Some(v) = &self.lte {
            obj.insert("$lte".into(), v.clone());
        }
        Value::Object(obj)
    }
}

impl OrderBy {
    /// Parse from `{field: "asc"|"desc"}` or `[["field", "asc"], ...]`.
    pub fn parse(value: &Value) -> Result<Self> {
        let mut keys = Vec::new();
        match value {
            Value::Object(obj) => {
                for (field, dir) in obj {
                    keys.push((field.clone(), Self::direction(dir)?));
                }
            }
            Value::Array(items) => {
                for item in items {
                    let pair = item.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        Error::InvalidClause("orderBy entries must be [field, direction]".into())
                    })?;
                    let field = pair[0]
                        .as_str()
                        .ok_or_else(|| Error::InvalidClause("orderBy field must be a string".into()))?;
                    keys.push((field.to_string(), Self::direction(&pair[1])?));
                }
            }
            _ => {
                return Err(Error::InvalidClause(
                    "orderBy must be an object or an array".into(),
                ))
            }
        }
        Ok(OrderBy(keys))
    }

    fn direction(value: &Value) -> Result<Direction> {
        match value.as_str() {
            Some("asc") => Ok(Direction::Asc),
            Some("desc") => Ok(Direction::Desc),
            _ => Err(Error::InvalidClause(
                "order direction must be \"asc\" or \"desc\"".into(),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|(field, dir)| {
                    serde_json::json!([field, match dir {
                        Direction::Asc => "asc",
                        Direction::Desc => "desc",
                    }])
                })
                .collect(),
        )
    }
}

impl IncludeClause {
    /// Parse from `{relation: true | subquery}`.
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidClause("include must be an object".into()))?;

        let mut include = BTreeMap::new();
        for (relation, spec) in obj {
            let spec = match spec {
                Value::Bool(true) => IncludeSpec::All,
                Value::Bool(false) => continue,
                Value::Object(_) => IncludeSpec::Query(SubQuery::parse(spec)?),
                _ => {
                    return Err(Error::InvalidClause(format!(
                        "include for '{relation}' must be true or a sub-query"
                    )))
                }
            };
            include.insert(relation.clone(), spec);
        }
        Ok(IncludeClause(include))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(relation, spec)| {
                    let v = match spec {
                        IncludeSpec::All => Value::Bool(true),
                        IncludeSpec::Query(sub) => sub.to_value(),
                    };
                    (relation.clone(), v)
                })
                .collect(),
        )
    }

    /// Union with another include set. Sub-queries win over `All`; nested
    /// includes merge recursively.
    pub fn merge(mut self, other: IncludeClause) -> IncludeClause {
        for (relation, incoming) in other.0 {
            let merged = match (self.0.remove(&relation), incoming) {
                (None, incoming) => incoming,
                (Some(IncludeSpec::All), incoming) => incoming,
                (Some(existing), IncludeSpec::All) => existing,
                (Some(IncludeSpec::Query(mut a)), IncludeSpec::Query(b)) => {
                    a.include = match (a.include.take(), b.include) {
                        (Some(x), Some(y)) => Some(x.merge(y)),
                        (x, y) => x.or(y),
                    };
                    IncludeSpec::Query(a)
                }
            };
            self.0.insert(relation, merged);
        }
        self
    }
}

impl SubQuery {
    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidClause("sub-query must be an object".into()))?;

        let mut sub = SubQuery::default();
        for (key, v) in obj {
            match key.as_str() {
                "where" => sub.where_clause = Some(WhereClause::parse(v)?),
                "orderBy" => sub.order_by = Some(OrderBy::parse(v)?),
                "limit" => {
                    sub.limit = Some(v.as_u64().ok_or_else(|| {
                        Error::InvalidClause("limit must be a non-negative integer".into())
                    })?)
                }
                "include" => sub.include = Some(IncludeClause::parse(v)?),
                other => {
                    return Err(Error::InvalidClause(format!(
                        "unknown sub-query key '{other}'"
                    )))
                }
            }
        }
        Ok(sub)
    }

    fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if let Some(w) = &self.where_clause {
            obj.insert("where".into(), w.to_value());
        }
        if let Some(o) = &self.order_by {
            obj.insert("orderBy".into(), o.to_value());
        }
        if let Some(l) = self.limit {
            obj.insert("limit".into(), Value::from(l));
        }
        if let Some(i) = &self.include {
            obj.insert("include".into(), i.to_value());
        }
        Value::Object(obj)
    }
}

impl Query {
    /// Parse a full query object `{where?, include?, orderBy?, limit?}`.
    pub fn parse(value: &Value) -> Result<Self> {
        let sub = SubQuery::parse(value)?;
        Ok(Query {
            where_clause: sub.where_clause,
            include: sub.include,
            order_by: sub.order_by,
            limit: sub.limit,
        })
    }

    pub fn to_value(&self) -> Value {
        SubQuery {
            where_clause: self.where_clause.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            include: self.include.clone(),
        }
        .to_value()
    }

    /// Validate against the schema.
    pub fn validate(&self, schema: &Schema, collection: &Collection) -> Result<()> {
        if let Some(where_clause) = &self.where_clause {
            where_clause.validate(schema, collection)?;
        }
        if let Some(include) = &self.include {
            include.validate(schema, collection)?;
        }
        if let Some(order_by) = &self.order_by {
            for (field, _) in &order_by.0 {
                if collection.field(field).is_none() {
                    return Err(Error::UnknownField {
                        collection: collection.name.clone(),
                        field: field.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl WhereClause {
    /// Validate field references and operator typing against the schema.
    pub fn validate(&self, schema: &Schema, collection: &Collection) -> Result<()> {
        match self {
            WhereClause::And(branches) | WhereClause::Or(branches) => {
                for branch in branches {
                    branch.validate(schema, collection)?;
                }
                Ok(())
            }
            WhereClause::Fields(fields) => {
                for (name, condition) in fields {
                    match condition {
                        FieldCondition::Related(nested) => {
                            let relation = collection.relation(name).ok_or_else(|| {
                                Error::UnknownField {
                                    collection: collection.name.clone(),
                                    field: name.clone(),
                                }
                            })?;
                            let target = schema.expect_collection(&relation.target)?;
                            nested.validate(schema, target)?;
                        }
                        FieldCondition::Equals(_) | FieldCondition::Ops(_) => {
                            let field = collection.field(name).ok_or_else(|| {
                                Error::UnknownField {
                                    collection: collection.name.clone(),
                                    field: name.clone(),
                                }
                            })?;
                            if let FieldCondition::Ops(ops) = condition {
                                validate_ops(name, field.is_ordered(), ops)?;
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

fn validate_ops(field: &str, ordered: bool, ops: &CompareOps) -> Result<()> {
    let ordered_ops = [
        ("$gt", ops.gt.is_some()),
        ("$gte", ops.gte.is_some()),
        ("$lt", ops.lt.is_some()),
        ("$lte", ops.lte.is_some()),
    ];
    for (name, present) in ordered_ops {
        if present && !ordered {
            return Err(Error::InvalidOperator {
                field: field.to_string(),
                operator: name.to_string(),
                reason: "only valid on number and timestamp fields".to_string(),
            });
        }
    }
    if let Some(NotCondition::Ops(inner)) = ops.not.as_deref() {
        validate_ops(field, ordered, inner)?;
    }
    Ok(())
}

impl IncludeClause {
    /// Validate relation names and nested queries against the schema.
    pub fn validate(&self, schema: &Schema, collection: &Collection) -> Result<()> {
        for (name, spec) in &self.0 {
            let relation = collection
                .relation(name)
                .ok_or_else(|| Error::UnknownField {
                    collection: collection.name.clone(),
                    field: name.clone(),
                })?;
            if let IncludeSpec::Query(sub) = spec {
                let target = schema.expect_collection(&relation.target)?;
                if let Some(where_clause) = &sub.where_clause {
                    where_clause.validate(schema, target)?;
                }
                if let Some(include) = &sub.include {
                    include.validate(schema, target)?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory evaluation
// ---------------------------------------------------------------------------

impl WhereClause {
    /// Evaluate against an inferred row.
    ///
    /// Relation traversal reads the joined object/array off the row; a
    /// missing relation slot never matches, mirroring the SQL plan the
    /// storage layer compiles for the same clause.
    pub fn matches(&self, schema: &Schema, collection: &Collection, row: &Value) -> bool {
        match self {
            WhereClause::And(branches) => branches
                .iter()
                .all(|branch| branch.matches(schema, collection, row)),
            WhereClause::Or(branches) => branches
                .iter()
                .any(|branch| branch.matches(schema, collection, row)),
            WhereClause::Fields(fields) => fields.iter().all(|(name, condition)| {
                let slot = row.get(name).unwrap_or(&Value::Null);
                match condition {
                    FieldCondition::Equals(expected) => eval_eq(slot, expected),
                    FieldCondition::Ops(ops) => eval_ops(slot, ops),
                    FieldCondition::Related(nested) => {
                        let Some(relation) = collection.relation(name) else {
                            return false;
                        };
                        let Some(target) = schema.collection(&relation.target) else {
                            return false;
                        };
                        match relation.kind {
                            RelationKind::One => {
                                slot.is_object() && nested.matches(schema, target, slot)
                            }
                            RelationKind::Many => slot
                                .as_array()
                                .map(|rows| {
                                    rows.iter().any(|r| nested.matches(schema, target, r))
                                })
                                .unwrap_or(false),
                        }
                    }
                }
            }),
        }
    }
}

fn eval_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Null, Value::Null) => true,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (a, b) => a == b,
    }
}

fn eval_cmp(actual: &Value, bound: &Value) -> Option<std::cmp::Ordering> {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn eval_ops(actual: &Value, ops: &CompareOps) -> bool {
    if let Some(expected) = &ops.eq {
        if !eval_eq(actual, expected) {
            return false;
        }
    }
    if let Some(list) = &ops.within {
        if !list.iter().any(|candidate| eval_eq(actual, candidate)) {
            return false;
        }
    }
    if let Some(not) = ops.not.as_deref() {
        let negated_matches = match not {
            // `$not: null` means IS NOT NULL.
            NotCondition::Equals(Value::Null) => !actual.is_null(),
            // SQL three-valued logic: a null never satisfies `<>`.
            NotCondition::Equals(expected) => !actual.is_null() && !eval_eq(actual, expected),
            NotCondition::Ops(inner) => !actual.is_null() && !eval_ops(actual, inner),
        };
        if !negated_matches {
            return false;
        }
    }
    for (bound, accept) in [
        (&ops.gt, [std::cmp::Ordering::Greater].as_slice()),
        (
            &ops.gte,
            [std::cmp::Ordering::Greater, std::cmp::Ordering::Equal].as_slice(),
        ),
        (&ops.lt, [std::cmp::Ordering::Less].as_slice()),
        (
            &ops.lte,
            [std::cmp::Ordering::Less, std::cmp::Ordering::Equal].as_slice(),
        ),
    ] {
        if let Some(bound) = bound {
            match eval_cmp(actual, bound) {
                Some(ordering) if accept.contains(&ordering) => {}
                _ => return false,
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Implicit includes
// ---------------------------------------------------------------------------

/// Derive the implicit include set from the relations a where-clause touches,
/// so rows returned for that clause carry the joined data the predicate
/// needed.
pub fn extract_include_from_where(where_clause: &WhereClause) -> IncludeClause {
    let mut include = IncludeClause::default();
    match where_clause {
        WhereClause::And(branches) | WhereClause::Or(branches) => {
            for branch in branches {
                include = include.merge(extract_include_from_where(branch));
            }
        }
        WhereClause::Fields(fields) => {
            for (name, condition) in fields {
                if let FieldCondition::Related(nested) = condition {
                    let deeper = extract_include_from_where(nested);
                    let spec = if deeper.0.is_empty() {
                        IncludeSpec::All
                    } else {
                        IncludeSpec::Query(SubQuery {
                            include: Some(deeper),
                            ..SubQuery::default()
                        })
                    };
                    include = include.merge(IncludeClause(
                        [(name.clone(), spec)].into_iter().collect(),
                    ));
                }
            }
        }
    }
    include
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{id, number, reference, string};
    use crate::schema::{collection, create_relations, create_schema, many, one};
    use serde_json::json;

    fn blog_schema() -> Schema {
        let users = collection("users", [("id", id()), ("name", string().nullable())]);
        let posts = collection(
            "posts",
            [
                ("id", id()),
                ("title", string()),
                ("views", number().nullable()),
                ("userId", reference("users", "id")),
            ],
        );
        let comments = collection(
            "comments",
            [
                ("id", id()),
                ("body", string()),
                ("postId", reference("posts", "id")),
            ],
        );

        let user_rel = create_relations(&users, [("posts", many("posts", "userId"))]);
        let post_rel = create_relations(
            &posts,
            [
                ("user", one("users", "userId")),
                ("comments", many("comments", "postId")),
            ],
        );
        let comment_rel = create_relations(&comments, [("post", one("posts", "postId"))]);

        create_schema([users, posts, comments], [user_rel, post_rel, comment_rel]).unwrap()
    }

    #[test]
    fn parse_scalar_and_ops() {
        let clause = WhereClause::parse(&json!({"name": "Ada", "views": {"$gt": 10}})).unwrap();
        let WhereClause::Fields(fields) = &clause else {
            panic!("expected fields");
        };
        assert!(matches!(fields["name"], FieldCondition::Equals(_)));
        assert!(matches!(fields["views"], FieldCondition::Ops(_)));
    }

    #[test]
    fn parse_nested_relation() {
        let clause = WhereClause::parse(&json!({"user": {"name": "Ada"}})).unwrap();
        let WhereClause::Fields(fields) = &clause else {
            panic!("expected fields");
        };
        assert!(matches!(fields["user"], FieldCondition::Related(_)));
    }

    #[test]
    fn parse_and_or() {
        let clause = WhereClause::parse(&json!({
            "$or": [{"name": "Ada"}, {"name": "Al"}]
        }))
        .unwrap();
        assert!(matches!(clause, WhereClause::Or(branches) if branches.len() == 2));

        let err = WhereClause::parse(&json!({"$and": [], "name": "Ada"})).unwrap_err();
        assert!(matches!(err, Error::InvalidClause(_)));
    }

    #[test]
    fn parse_rejects_unknown_operator() {
        let err = WhereClause::parse(&json!({"views": {"$near": 3}})).unwrap_err();
        assert!(matches!(err, Error::InvalidClause(_)));
    }

    #[test]
    fn roundtrip_to_value() {
        let source = json!({
            "$or": [
                {"name": {"$not": null}},
                {"views": {"$gte": 10, "$lt": 100}, "title": "x"}
            ]
        });
        let clause = WhereClause::parse(&source).unwrap();
        let reparsed = WhereClause::parse(&clause.to_value()).unwrap();
        assert_eq!(clause, reparsed);
    }

    #[test]
    fn validate_operator_typing() {
        let schema = blog_schema();
        let posts = schema.collection("posts").unwrap();

        let ok = WhereClause::parse(&json!({"views": {"$gt": 100}})).unwrap();
        assert!(ok.validate(&schema, posts).is_ok());

        let bad = WhereClause::parse(&json!({"title": {"$gt": "a"}})).unwrap();
        let err = bad.validate(&schema, posts).unwrap_err();
        assert!(matches!(err, Error::InvalidOperator { operator, .. } if operator == "$gt"));
    }

    #[test]
    fn validate_unknown_field() {
        let schema = blog_schema();
        let posts = schema.collection("posts").unwrap();

        let clause = WhereClause::parse(&json!({"missing": 1})).unwrap();
        assert!(matches!(
            clause.validate(&schema, posts),
            Err(Error::UnknownField { field, .. }) if field == "missing"
        ));
    }

    #[test]
    fn validate_nested_relation_clause() {
        let schema = blog_schema();
        let comments = schema.collection("comments").unwrap();

        let clause = WhereClause::parse(&json!({"post": {"user": {"name": "Ada"}}})).unwrap();
        assert!(clause.validate(&schema, comments).is_ok());

        let bad = WhereClause::parse(&json!({"post": {"user": {"nope": 1}}})).unwrap();
        assert!(bad.validate(&schema, comments).is_err());
    }

    #[test]
    fn matches_scalars_and_null() {
        let schema = blog_schema();
        let users = schema.collection("users").unwrap();

        let named = WhereClause::parse(&json!({"name": "John"})).unwrap();
        let unnamed = WhereClause::parse(&json!({"name": null})).unwrap();
        let not_null = WhereClause::parse(&json!({"name": {"$not": null}})).unwrap();

        let john = json!({"id": "u1", "name": "John"});
        let anon = json!({"id": "u2", "name": null});

        assert!(named.matches(&schema, users, &john));
        assert!(!named.matches(&schema, users, &anon));
        assert!(unnamed.matches(&schema, users, &anon));
        assert!(!unnamed.matches(&schema, users, &john));
        assert!(not_null.matches(&schema, users, &john));
        assert!(!not_null.matches(&schema, users, &anon));
    }

    #[test]
    fn matches_comparators() {
        let schema = blog_schema();
        let posts = schema.collection("posts").unwrap();

        let clause = WhereClause::parse(&json!({"views": {"$gt": 100}})).unwrap();
        assert!(clause.matches(&schema, posts, &json!({"views": 150})));
        assert!(!clause.matches(&schema, posts, &json!({"views": 100})));
        assert!(!clause.matches(&schema, posts, &json!({"views": null})));

        let within = WhereClause::parse(&json!({"title": {"$in": ["a", "b"]}})).unwrap();
        assert!(within.matches(&schema, posts, &json!({"title": "a"})));
        assert!(!within.matches(&schema, posts, &json!({"title": "c"})));

        let not_in =
            WhereClause::parse(&json!({"title": {"$not": {"$in": ["a", "b"]}}})).unwrap();
        assert!(not_in.matches(&schema, posts, &json!({"title": "c"})));
        assert!(!not_in.matches(&schema, posts, &json!({"title": "a"})));
    }

    #[test]
    fn matches_relation_traversal() {
        let schema = blog_schema();
        let comments = schema.collection("comments").unwrap();

        let clause = WhereClause::parse(&json!({"post": {"user": {"name": "Ada"}}})).unwrap();

        let comment = json!({
            "id": "c1",
            "body": "nice",
            "post": {"id": "p1", "user": {"id": "u1", "name": "Ada"}}
        });
        assert!(clause.matches(&schema, comments, &comment));

        let other = json!({
            "id": "c2",
            "body": "hm",
            "post": {"id": "p2", "user": {"id": "u2", "name": "Bob"}}
        });
        assert!(!clause.matches(&schema, comments, &other));

        // Missing joined data never matches.
        let bare = json!({"id": "c3", "body": "?"});
        assert!(!clause.matches(&schema, comments, &bare));
    }

    #[test]
    fn matches_many_relation() {
        let schema = blog_schema();
        let users = schema.collection("users").unwrap();

        let clause = WhereClause::parse(&json!({"posts": {"views": {"$gt": 100}}})).unwrap();

        let busy = json!({
            "id": "u1",
            "posts": [{"id": "p1", "views": 50}, {"id": "p2", "views": 150}]
        });
        let quiet = json!({"id": "u2", "posts": [{"id": "p3", "views": 5}]});

        assert!(clause.matches(&schema, users, &busy));
        assert!(!clause.matches(&schema, users, &quiet));
    }

    #[test]
    fn include_parse_and_roundtrip() {
        let include = IncludeClause::parse(&json!({
            "user": true,
            "comments": {"where": {"body": {"$not": null}}, "limit": 10}
        }))
        .unwrap();

        assert!(matches!(include.0["user"], IncludeSpec::All));
        assert!(matches!(include.0["comments"], IncludeSpec::Query(_)));

        let reparsed = IncludeClause::parse(&include.to_value()).unwrap();
        assert_eq!(include, reparsed);
    }

    #[test]
    fn extract_include_covers_where_relations() {
        let clause =
            WhereClause::parse(&json!({"post": {"user": {"name": "Ada"}}, "body": "x"})).unwrap();
        let include = extract_include_from_where(&clause);

        let IncludeSpec::Query(sub) = &include.0["post"] else {
            panic!("expected nested include");
        };
        let nested = sub.include.as_ref().unwrap();
        assert!(matches!(nested.0["user"], IncludeSpec::All));
    }

    #[test]
    fn query_parse_full() {
        let schema = blog_schema();
        let posts = schema.collection("posts").unwrap();

        let query = Query::parse(&json!({
            "where": {"views": {"$gte": 1}},
            "include": {"user": true},
            "orderBy": [["views", "desc"]],
            "limit": 25
        }))
        .unwrap();

        assert!(query.validate(&schema, posts).is_ok());
        assert_eq!(query.limit, Some(25));

        let reparsed = Query::parse(&query.to_value()).unwrap();
        assert_eq!(query, reparsed);
    }
}
