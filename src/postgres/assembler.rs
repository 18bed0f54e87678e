//! Groups decoded messages into transactions and turns row messages into
//! [`DataChangeEvent`]s.

use tracing::trace;
use uuid::Uuid;

use super::message::{
    CommitMessage, IdentityMarker, Message, RelationMessage, TupleColumn, WalMessage,
};
use super::registry::Registry;
use crate::event::{DataChangeEvent, DeleteEvent, Field, InsertEvent, UpdateEvent};
use crate::{Error, Result};

/// Messages of one source transaction, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionBlock {
    pub xid: u32,
    pub messages: Vec<WalMessage>,
}

impl TransactionBlock {
    /// The commit and the slot position it was read at. `None` until the
    /// whole transaction has been received.
    pub fn commit(&self) -> Option<(&str, &CommitMessage)> {
        self.messages.iter().find_map(|m| match &m.message {
            Message::Commit(commit) => Some((m.lsn.as_str(), commit)),
            _ => None,
        })
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationMessage> {
        self.messages.iter().filter_map(|m| match &m.message {
            Message::Relation(relation) => Some(relation),
            _ => None,
        })
    }
}

/// Stable group-by on xid: blocks appear in order of their first message
/// and keep their messages in arrival order.
pub fn assemble(messages: Vec<WalMessage>) -> Vec<TransactionBlock> {
    let mut blocks: Vec<TransactionBlock> = Vec::new();

    for message in messages {
        match blocks.iter_mut().find(|b| b.xid == message.xid) {
            Some(block) => block.messages.push(message),
            None => blocks.push(TransactionBlock {
                xid: message.xid,
                messages: vec![message],
            }),
        }
    }

    blocks
}

/// One resolved column along with its key flag from the relation.
struct ImageField {
    field: Field,
    part_of_key: bool,
}

/// Derives change events for one transaction block.
///
/// Relation messages are recorded in the registry as they are met, so a row
/// message always sees the latest definition of its relation.
pub fn to_events(block: &TransactionBlock, registry: &mut Registry) -> Result<Vec<DataChangeEvent>> {
    let mut events = Vec::new();

    for wal in &block.messages {
        let event = match &wal.message {
            Message::Relation(relation) => {
                registry.observe_relation(relation);
                continue;
            }
            Message::Insert(insert) => {
                let relation = registry.relation(insert.relation_oid)?;
                let fields = resolve_image(registry, relation, &insert.columns)?
                    .into_iter()
                    .map(|f| f.field)
                    .collect();

                DataChangeEvent::Insert(InsertEvent {
                    id: Uuid::new_v4(),
                    namespace: relation.namespace.clone(),
                    table: relation.name.clone(),
                    transaction_id: wal.xid,
                    fields,
                })
            }
            Message::Update(update) => {
                let relation = registry.relation(update.relation_oid)?;
                let new_image = resolve_image(registry, relation, &update.new_columns)?;

                let (identifying_fields, updated_fields) = match update.marker {
                    IdentityMarker::Key => {
                        let old_image = resolve_image(registry, relation, &update.old_columns)?;
                        let identifying = key_fields(old_image);
                        let updated = new_image
                            .into_iter()
                            .map(|f| f.field)
                            .filter(|f| !identifying.contains(f))
                            .collect();
                        (identifying, updated)
                    }
                    IdentityMarker::OldTuple => {
                        let old_image = resolve_image(registry, relation, &update.old_columns)?;
                        (
                            full_identity(registry, relation, old_image),
                            new_image.into_iter().map(|f| f.field).collect(),
                        )
                    }
                    IdentityMarker::None => {
                        let (key, rest): (Vec<_>, Vec<_>) =
                            new_image.into_iter().partition(|f| f.part_of_key);
                        (
                            key.into_iter().map(|f| f.field).collect(),
                            rest.into_iter().map(|f| f.field).collect(),
                        )
                    }
                };

                DataChangeEvent::Update(UpdateEvent {
                    id: Uuid::new_v4(),
                    namespace: relation.namespace.clone(),
                    table: relation.name.clone(),
                    transaction_id: wal.xid,
                    identifying_fields,
                    updated_fields,
                })
            }
            Message::Delete(delete) => {
                let relation = registry.relation(delete.relation_oid)?;
                let image = resolve_image(registry, relation, &delete.columns)?;

                let identifying_fields = match delete.marker {
                    IdentityMarker::OldTuple => full_identity(registry, relation, image),
                    IdentityMarker::Key | IdentityMarker::None => key_fields(image),
                };

                DataChangeEvent::Delete(DeleteEvent {
                    id: Uuid::new_v4(),
                    namespace: relation.namespace.clone(),
                    table: relation.name.clone(),
                    transaction_id: wal.xid,
                    identifying_fields,
                })
            }
            other => {
                trace!(xid = wal.xid, "Skipping {} message", other.name());
                continue;
            }
        };

        events.push(event);
    }

    Ok(events)
}

fn resolve_image(
    registry: &Registry,
    relation: &RelationMessage,
    columns: &[TupleColumn],
) -> Result<Vec<ImageField>> {
    if columns.len() > relation.columns.len() {
        return Err(Error::IllegalState(format!(
            "tuple has {} columns but relation {} has {}",
            columns.len(),
            relation.full_name(),
            relation.columns.len()
        )));
    }

    let mut fields = Vec::with_capacity(columns.len());
    for (index, (definition, column)) in relation.columns.iter().zip(columns).enumerate() {
        if let Some(field) = registry.resolve(relation.oid, index, column)? {
            fields.push(ImageField {
                field,
                part_of_key: definition.part_of_key,
            });
        }
    }
    Ok(fields)
}

fn key_fields(image: Vec<ImageField>) -> Vec<Field> {
    image
        .into_iter()
        .filter(|f| f.part_of_key)
        .map(|f| f.field)
        .collect()
}

/// Identity for a full old-row image: narrowed to the table's identifying
/// constraint when the catalog knows one, otherwise the whole row.
fn full_identity(registry: &Registry, relation: &RelationMessage, image: Vec<ImageField>) -> Vec<Field> {
    let fields = image.into_iter().map(|f| f.field);

    match registry.identity_columns(&relation.full_name()) {
        Some(columns) => fields.filter(|f| columns.contains(&f.name)).collect(),
        None => fields.collect(),
    }
}
