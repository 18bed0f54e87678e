use std::collections::HashMap;
use tracing::debug;

use super::codec;
use super::message::{RelationColumn, RelationMessage, TupleColumn};
use super::types::TypeMapping;
use crate::event::{Field, FieldValue};
use crate::{Error, Result};

/// Type and relation metadata needed to turn tuple data into fields.
///
/// The type map is filled once when a collector starts. Relations are
/// recorded as Relation messages stream past; a later definition of the same
/// oid replaces the earlier one.
#[derive(Debug, Default)]
pub struct Registry {
    types: HashMap<u32, TypeMapping>,
    relations: HashMap<u32, RelationMessage>,
    /// Identifying column names per `schema.table`, from catalog constraints.
    identities: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new(type_names: HashMap<u32, String>) -> Self {
        let types = type_names
            .into_iter()
            .map(|(oid, name)| (oid, TypeMapping::from_type_name(&name)))
            .collect();

        Self {
            types,
            ..Default::default()
        }
    }

    pub fn with_identities(mut self, identities: HashMap<String, Vec<String>>) -> Self {
        self.identities = identities;
        self
    }

    pub fn observe_relation(&mut self, relation: &RelationMessage) {
        debug!(
            oid = relation.oid,
            "Observed relation {}.{} with {} columns",
            relation.namespace,
            relation.name,
            relation.columns.len()
        );
        self.relations.insert(relation.oid, relation.clone());
    }

    pub fn relation(&self, oid: u32) -> Result<&RelationMessage> {
        self.relations
            .get(&oid)
            .ok_or_else(|| Error::IllegalState(format!("no relation message for oid {}", oid)))
    }

    /// Column names identifying rows of `schema.table`, when the catalog
    /// provided a usable constraint.
    pub fn identity_columns(&self, full_name: &str) -> Option<&[String]> {
        self.identities.get(full_name).map(Vec::as_slice)
    }

    /// Resolves column `index` of a tuple for relation `relation_oid`.
    /// Toasted columns yield `None`.
    pub fn resolve(
        &self,
        relation_oid: u32,
        index: usize,
        column: &TupleColumn,
    ) -> Result<Option<Field>> {
        let relation = self.relation(relation_oid)?;
        let definition = relation.columns.get(index).ok_or_else(|| {
            Error::IllegalState(format!(
                "column {} out of range for relation {} with {} columns",
                index,
                relation.full_name(),
                relation.columns.len()
            ))
        })?;
        self.resolve_column(definition, column)
    }

    fn resolve_column(
        &self,
        definition: &RelationColumn,
        column: &TupleColumn,
    ) -> Result<Option<Field>> {
        if matches!(column, TupleColumn::Toasted) {
            return Ok(None);
        }

        // An unmapped type fails here even when the value is NULL.
        let field_type = self
            .types
            .get(&definition.type_oid)
            .ok_or_else(|| {
                Error::NotImplemented(format!(
                    "unknown type oid {} for column {}",
                    definition.type_oid, definition.name
                ))
            })?
            .field_type()?;

        let raw = match column {
            TupleColumn::Text(raw) | TupleColumn::Binary(raw) => raw,
            _ => return Ok(Some(Field::null(&definition.name))),
        };

        let value: FieldValue = match column {
            TupleColumn::Binary(_) => codec::parse_binary(field_type, raw)?,
            _ => {
                let text = std::str::from_utf8(raw).map_err(|e| {
                    Error::IllegalArgument(format!(
                        "column {} is not valid UTF-8: {}",
                        definition.name, e
                    ))
                })?;
                codec::parse_text(field_type, text)?
            }
        };

        Ok(Some(Field::new(&definition.name, value)))
    }
}
