//! Schema definition and validation.
//!
//! A schema is a set of named collections, each a map of typed fields plus
//! relations to other collections. Relations are declared against collection
//! *names* and attached in a second pass, so forward references and cycles
//! need no special handling.

use crate::error::{Error, Result};
use crate::field::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cardinality of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    One,
    Many,
}

/// A relation from one collection to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Name of the target collection.
    pub target: String,
    pub kind: RelationKind,
    /// Whether the foreign key must be non-null (`one` relations only).
    pub required: bool,
    /// FK column on the source row (`one` relations).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relational_column: Option<String>,
    /// FK column on the target rows pointing back at us (`many` relations).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_column: Option<String>,
}

/// A to-one relation: this row holds an FK in `relational_column`.
pub fn one(target: impl Into<String>, relational_column: impl Into<String>) -> Relation {
    Relation {
        target: target.into(),
        kind: RelationKind::One,
        required: false,
        relational_column: Some(relational_column.into()),
        foreign_column: None,
    }
}

/// A to-many relation: target rows hold an FK to us in `foreign_column`.
pub fn many(target: impl Into<String>, foreign_column: impl Into<String>) -> Relation {
    Relation {
        target: target.into(),
        kind: RelationKind::Many,
        required: false,
        relational_column: None,
        foreign_column: Some(foreign_column.into()),
    }
}

impl Relation {
    /// Mark the relation as required (non-nullable FK).
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A named relational entity: fields plus relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub name: String,
    pub fields: BTreeMap<String, FieldType>,
    pub relations: BTreeMap<String, Relation>,
}

/// Declare a collection with its fields. Relations are attached by
/// [`create_schema`] from [`create_relations`] declarations.
pub fn collection<I, S>(name: impl Into<String>, fields: I) -> Collection
where
    I: IntoIterator<Item = (S, FieldType)>,
    S: Into<String>,
{
    Collection {
        name: name.into(),
        fields: fields
            .into_iter()
            .map(|(name, ft)| (name.into(), ft))
            .collect(),
        relations: BTreeMap::new(),
    }
}

impl Collection {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// Look up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Name of the primary field. Valid after schema validation, which
    /// guarantees exactly one.
    pub fn primary_field(&self) -> &str {
        self.fields
            .iter()
            .find(|(_, ft)| ft.primary)
            .map(|(name, _)| name.as_str())
            .unwrap_or("id")
    }
}

/// A tagged relations declaration produced by [`create_relations`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationsDecl {
    pub collection_name: String,
    pub relations: Vec<(String, Relation)>,
}

/// Declare the relations of `source`, to be attached by [`create_schema`].
pub fn create_relations<I, S>(source: &Collection, relations: I) -> RelationsDecl
where
    I: IntoIterator<Item = (S, Relation)>,
    S: Into<String>,
{
    RelationsDecl {
        collection_name: source.name.clone(),
        relations: relations
            .into_iter()
            .map(|(name, rel)| (name.into(), rel))
            .collect(),
    }
}

/// A validated schema: collections with their relations attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub collections: BTreeMap<String, Collection>,
}

impl Schema {
    /// Look up a collection by name.
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    /// Look up a collection or fail with `UnknownCollection`.
    pub fn expect_collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// Serialize to JSON, for the migration tooling.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse from JSON and re-validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let schema: Schema =
            serde_json::from_str(json).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        validate(&schema)?;
        Ok(schema)
    }
}

/// Assemble a schema from collections and relation declarations.
///
/// Two-phase: collections are registered first, then relations are attached
/// by collection name, then the whole graph is validated.
pub fn create_schema<C, R>(collections: C, relation_decls: R) -> Result<Schema>
where
    C: IntoIterator<Item = Collection>,
    R: IntoIterator<Item = RelationsDecl>,
{
    let mut map: BTreeMap<String, Collection> = BTreeMap::new();
    for coll in collections {
        if map.contains_key(&coll.name) {
            return Err(Error::DuplicateCollection(coll.name));
        }
        map.insert(coll.name.clone(), coll);
    }

    for decl in relation_decls {
        let coll = map
            .get_mut(&decl.collection_name)
            .ok_or_else(|| Error::UnknownCollection(decl.collection_name.clone()))?;
        for (name, relation) in decl.relations {
            coll.relations.insert(name, relation);
        }
    }

    let schema = Schema { collections: map };
    validate(&schema)?;
    Ok(schema)
}

fn validate(schema: &Schema) -> Result<()> {
    for (name, coll) in &schema.collections {
        let primaries = coll.fields.values().filter(|ft| ft.primary).count();
        if primaries != 1 {
            return Err(Error::PrimaryKeyCount {
                collection: name.clone(),
                count: primaries,
            });
        }

        for (field_name, field) in &coll.fields {
            if let Some(reference) = &field.references {
                let target = schema.collections.get(&reference.collection).ok_or_else(|| {
                    Error::BrokenReference {
                        collection: name.clone(),
                        field: field_name.clone(),
                        target: reference.collection.clone(),
                    }
                })?;
                if !target.fields.contains_key(&reference.field) {
                    return Err(Error::BrokenReference {
                        collection: name.clone(),
                        field: field_name.clone(),
                        target: format!("{}.{}", reference.collection, reference.field),
                    });
                }
            }
        }

        for (rel_name, relation) in &coll.relations {
            let target =
                schema
                    .collections
                    .get(&relation.target)
                    .ok_or_else(|| Error::UnknownRelationTarget {
                        collection: name.clone(),
                        relation: rel_name.clone(),
                        target: relation.target.clone(),
                    })?;

            match relation.kind {
                RelationKind::One => {
                    let column = relation.relational_column.as_deref().unwrap_or("");
                    if !coll.fields.contains_key(column) {
                        return Err(Error::UnknownRelationColumn {
                            collection: name.clone(),
                            relation: rel_name.clone(),
                            column: column.to_string(),
                        });
                    }
                }
                RelationKind::Many => {
                    let column = relation.foreign_column.as_deref().unwrap_or("");
                    if !target.fields.contains_key(column) {
                        return Err(Error::UnknownRelationColumn {
                            collection: name.clone(),
                            relation: rel_name.clone(),
                            column: column.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}
