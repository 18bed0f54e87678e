//! Replays transactions on the destination database.
//!
//! Every applied transaction carries the loop marker, so the destination's
//! own collector drops it instead of sending it back. Re-deliveries are
//! filtered on the source xid, which makes applying a transaction twice a
//! no-op.

use async_trait::async_trait;
use postgres_protocol::escape::escape_identifier;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};

use crate::config::{InsertConflictStrategy, ProcessorConfig, ProcessorTableConfig};
use crate::event::{
    DataChangeEvent, DeleteEvent, Field, FieldType, FieldValue, InsertEvent, Transaction, UpdateEvent,
};
use crate::postgres::connection::PgConnection;
use crate::postgres::replication::emit_skip_marker;
use crate::sink::Sink;
use crate::{Error, Result};

pub struct Processor {
    pg_config: tokio_postgres::Config,
    config: ProcessorConfig,
    /// Highest xid applied per source.
    last_applied: Mutex<HashMap<String, u32>>,
}

impl Processor {
    pub fn new(pg_config: tokio_postgres::Config, config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pg_config,
            config,
            last_applied: Mutex::new(HashMap::new()),
        })
    }

    /// Applies `transaction` in one destination transaction. Calls are
    /// serialized; on failure nothing is recorded so a redelivery retries.
    pub async fn apply(&self, transaction: &Transaction) -> Result<()> {
        let mut last_applied = self.last_applied.lock().await;
        let source = transaction.source_name.as_str();

        let events = pending_events(transaction, last_applied.get(source).copied());
        let Some(highest) = highest_xid(&events) else {
            debug!(source = %source, "Nothing left to apply in transaction {}", transaction.id);
            return Ok(());
        };

        let mut statements = Vec::with_capacity(events.len());
        for event in &events {
            let table = self.config.table(&event.full_table_name());
            if let Some(statement) = render(event, table)? {
                statements.push(statement);
            }
        }

        let mut connection = PgConnection::connect(&self.pg_config).await?;
        let db_transaction = connection.client_mut().transaction().await?;

        let applied = async {
            for statement in &statements {
                db_transaction.execute(statement.sql.as_str(), &statement.params).await?;
            }
            emit_skip_marker(&db_transaction).await
        }
        .await;

        if let Err(e) = applied {
            if let Err(rollback) = db_transaction.rollback().await {
                warn!(source = %source, "Rollback failed: {}", rollback);
            }
            return Err(e);
        }

        db_transaction.commit().await?;
        last_applied.insert(source.to_string(), highest);

        debug!(
            source = %source,
            xid = highest,
            statements = statements.len(),
            "Applied transaction {}",
            transaction.id
        );
        Ok(())
    }
}

#[async_trait]
impl Sink for Processor {
    async fn consume(&self, transaction: &Transaction) -> Result<()> {
        self.apply(transaction).await
    }
}

/// Postgres' `TransactionIdPrecedes`: xids compare modulo 2^32.
pub fn xid_precedes(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Events not yet applied for the transaction's source.
fn pending_events(transaction: &Transaction, last_applied: Option<u32>) -> Vec<&DataChangeEvent> {
    transaction
        .events
        .iter()
        .filter(|event| match last_applied {
            Some(last) if !xid_precedes(last, event.transaction_id()) => {
                warn!(
                    source = %transaction.source_name,
                    xid = event.transaction_id(),
                    last_applied = last,
                    "Skipping already applied event {}",
                    event.id()
                );
                false
            }
            _ => true,
        })
        .collect()
}

fn highest_xid(events: &[&DataChangeEvent]) -> Option<u32> {
    events
        .iter()
        .map(|e| e.transaction_id())
        .reduce(|a, b| if xid_precedes(a, b) { b } else { a })
}

/// SQL text plus the parameters bound to its placeholders.
struct Statement<'a> {
    sql: String,
    params: Vec<&'a (dyn ToSql + Sync)>,
}

/// Renders the statement for one event, `None` when there is nothing to do.
fn render<'a>(
    event: &'a DataChangeEvent,
    table: Option<&ProcessorTableConfig>,
) -> Result<Option<Statement<'a>>> {
    match event {
        DataChangeEvent::Insert(insert) => Ok(Some(render_insert(insert, table))),
        DataChangeEvent::Update(update) => render_update(update),
        DataChangeEvent::Delete(delete) => render_delete(delete).map(Some),
    }
}

fn render_insert<'a>(event: &'a InsertEvent, table: Option<&ProcessorTableConfig>) -> Statement<'a> {
    let mut binder = Binder::default();
    let target = qualified_name(&event.namespace, &event.table);

    let mut sql = if event.fields.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", target)
    } else {
        let columns: Vec<String> = event.fields.iter().map(|f| escape_identifier(&f.name)).collect();
        let values: Vec<String> = event.fields.iter().map(|f| binder.value(&f.value)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            target,
            columns.join(", "),
            values.join(", ")
        )
    };

    if let Some(table) = table {
        if let Some(constraint) = &table.insert_conflict_constraint {
            let constraint = escape_identifier(constraint);
            match table.insert_conflict_strategy {
                InsertConflictStrategy::Fail => {}
                InsertConflictStrategy::DoNothing => {
                    sql.push_str(&format!(" ON CONFLICT ON CONSTRAINT {} DO NOTHING", constraint));
                }
                InsertConflictStrategy::Update if event.fields.is_empty() => {
                    sql.push_str(&format!(" ON CONFLICT ON CONSTRAINT {} DO NOTHING", constraint));
                }
                InsertConflictStrategy::Update => {
                    let assignments: Vec<String> = event
                        .fields
                        .iter()
                        .map(|f| {
                            let column = escape_identifier(&f.name);
                            format!("{} = EXCLUDED.{}", column, column)
                        })
                        .collect();
                    sql.push_str(&format!(
                        " ON CONFLICT ON CONSTRAINT {} DO UPDATE SET {}",
                        constraint,
                        assignments.join(", ")
                    ));
                }
            }
        }
    }

    Statement {
        sql,
        params: binder.params,
    }
}

fn render_update(event: &UpdateEvent) -> Result<Option<Statement<'_>>> {
    let target = qualified_name(&event.namespace, &event.table);

    if event.updated_fields.is_empty() {
        debug!("Update of {} changes no columns, skipping", target);
        return Ok(None);
    }
    require_identity(&target, &event.identifying_fields)?;

    let mut binder = Binder::default();
    let assignments: Vec<String> = event
        .updated_fields
        .iter()
        .map(|f| format!("{} = {}", escape_identifier(&f.name), binder.value(&f.value)))
        .collect();
    let conditions = binder.conditions(&event.identifying_fields);

    Ok(Some(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            target,
            assignments.join(", "),
            conditions
        ),
        params: binder.params,
    }))
}

fn render_delete(event: &DeleteEvent) -> Result<Statement<'_>> {
    let target = qualified_name(&event.namespace, &event.table);
    require_identity(&target, &event.identifying_fields)?;

    let mut binder = Binder::default();
    let conditions = binder.conditions(&event.identifying_fields);

    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {}", target, conditions),
        params: binder.params,
    })
}

/// An update or delete without identifying fields would hit every row.
fn require_identity(target: &str, fields: &[Field]) -> Result<()> {
    if fields.is_empty() {
        return Err(Error::IllegalState(format!(
            "no identifying fields for change on {}",
            target
        )));
    }
    Ok(())
}

/// Collects parameters and hands out their placeholders.
#[derive(Default)]
struct Binder<'a> {
    params: Vec<&'a (dyn ToSql + Sync)>,
}

impl<'a> Binder<'a> {
    /// Placeholder for `value`, or the literal `NULL`.
    fn value(&mut self, value: &'a FieldValue) -> String {
        match sql_param(value) {
            Some(param) => {
                self.params.push(param);
                format!("${}{}", self.params.len(), placeholder_cast(value.field_type()))
            }
            None => "NULL".to_string(),
        }
    }

    /// `AND`-joined equality conditions. JSON has no equality operator, so
    /// json values are compared as jsonb.
    fn conditions(&mut self, fields: &'a [Field]) -> String {
        fields
            .iter()
            .map(|field| {
                let column = escape_identifier(&field.name);
                match field.value.field_type() {
                    FieldType::Null => format!("{} IS NULL", column),
                    FieldType::Json => format!("{}::jsonb = {}", column, self.jsonb(&field.value, "text")),
                    FieldType::JsonArray => {
                        format!("{}::jsonb[] = {}", column, self.jsonb(&field.value, "text[]"))
                    }
                    _ => format!("{} = {}", column, self.value(&field.value)),
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn jsonb(&mut self, value: &'a FieldValue, text_type: &str) -> String {
        match sql_param(value) {
            Some(param) => {
                self.params.push(param);
                let jsonb = if text_type.ends_with("[]") { "jsonb[]" } else { "jsonb" };
                format!("${}::{}::{}", self.params.len(), text_type, jsonb)
            }
            None => "NULL".to_string(),
        }
    }
}

/// JSON travels as text and is cast on the server.
fn placeholder_cast(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Json => "::text::json",
        FieldType::Jsonb => "::text::jsonb",
        FieldType::JsonArray => "::text[]::json[]",
        FieldType::JsonbArray => "::text[]::jsonb[]",
        _ => "",
    }
}

fn sql_param(value: &FieldValue) -> Option<&(dyn ToSql + Sync)> {
    let param: &(dyn ToSql + Sync) = match value {
        FieldValue::Null => return None,
        FieldValue::Float(v) => v,
        FieldValue::Double(v) => v,
        FieldValue::Boolean(v) => v,
        FieldValue::Text(v) | FieldValue::Json(v) | FieldValue::Jsonb(v) | FieldValue::Char(v) => v,
        FieldValue::Uuid(v) => v,
        FieldValue::Int16(v) => v,
        FieldValue::Int32(v) => v,
        FieldValue::Int64(v) => v,
        FieldValue::Bytes(v) => v,
        FieldValue::Date(v) => v,
        FieldValue::Time(v) => v,
        FieldValue::Timestamp(v) => v,
        FieldValue::TimestampTz(v) => v,
        FieldValue::FloatArray(v) => v,
        FieldValue::DoubleArray(v) => v,
        FieldValue::BooleanArray(v) => v,
        FieldValue::TextArray(v)
        | FieldValue::JsonArray(v)
        | FieldValue::JsonbArray(v)
        | FieldValue::CharArray(v) => v,
        FieldValue::UuidArray(v) => v,
        FieldValue::Int16Array(v) => v,
        FieldValue::Int32Array(v) => v,
        FieldValue::Int64Array(v) => v,
        FieldValue::BytesArray(v) => v,
        FieldValue::DateArray(v) => v,
        FieldValue::TimeArray(v) => v,
        FieldValue::TimestampArray(v) => v,
        FieldValue::TimestampTzArray(v) => v,
    };
    Some(param)
}

fn qualified_name(namespace: &str, table: &str) -> String {
    format!("{}.{}", escape_identifier(namespace), escape_identifier(table))
}
