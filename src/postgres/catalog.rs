use std::collections::HashMap;
use tokio_postgres::Client;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
}

/// A primary key or unique constraint of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintMetadata {
    pub name: String,
    pub kind: ConstraintKind,
    /// Constrained columns in attribute order.
    pub columns: Vec<String>,
    pub has_nullable_column: bool,
}

/// Picks the constraint that identifies a row of a table.
///
/// A configured preferred constraint wins and must exist. Otherwise the
/// primary key is used, then the first unique constraint whose columns are
/// all `NOT NULL`. `constraints` must list primary keys before unique
/// constraints, as [`load_constraints`] returns them.
pub fn identifying_constraint<'a>(
    table: &str,
    constraints: &'a [ConstraintMetadata],
    preferred: Option<&str>,
) -> Result<Option<&'a ConstraintMetadata>> {
    if let Some(preferred) = preferred {
        return constraints
            .iter()
            .find(|c| c.name == preferred)
            .map(Some)
            .ok_or_else(|| {
                Error::Setup(format!(
                    "unable to find constraint '{}' on table {}",
                    preferred, table
                ))
            });
    }

    Ok(constraints.iter().find(|c| match c.kind {
        ConstraintKind::PrimaryKey => true,
        ConstraintKind::Unique => !c.has_nullable_column,
    }))
}

/// `pg_type` oid to type name, for every type in the database.
pub async fn load_types(client: &Client) -> Result<HashMap<u32, String>> {
    let rows = client
        .query("SELECT oid, typname::text FROM pg_type", &[])
        .await?;

    let types: HashMap<u32, String> = rows
        .iter()
        .map(|row| (row.get::<_, u32>(0), row.get::<_, String>(1)))
        .collect();

    debug!("Loaded {} types from pg_type", types.len());
    Ok(types)
}

/// Primary key and unique constraints of every table in `schema`, keyed by
/// `schema.table`.
pub async fn load_constraints(
    client: &Client,
    schema: &str,
) -> Result<HashMap<String, Vec<ConstraintMetadata>>> {
    let rows = client
        .query(
            "SELECT t.relname::text, c.conname::text, c.contype::text, \
                    array_agg(a.attname::text ORDER BY a.attnum), \
                    bool_or(NOT a.attnotnull) \
             FROM pg_constraint c \
             JOIN pg_class t ON t.oid = c.conrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(c.conkey) \
             WHERE n.nspname = $1 AND c.contype IN ('p', 'u') \
             GROUP BY t.relname, c.oid, c.conname, c.contype \
             ORDER BY t.relname, c.contype, c.oid",
            &[&schema],
        )
        .await?;

    let mut constraints: HashMap<String, Vec<ConstraintMetadata>> = HashMap::new();
    for row in rows {
        let table: String = row.get(0);
        let kind = match row.get::<_, String>(2).as_str() {
            "p" => ConstraintKind::PrimaryKey,
            _ => ConstraintKind::Unique,
        };

        constraints
            .entry(format!("{}.{}", schema, table))
            .or_default()
            .push(ConstraintMetadata {
                name: row.get(1),
                kind,
                columns: row.get(3),
                has_nullable_column: row.get(4),
            });
    }

    debug!(schema, "Loaded constraints for {} tables", constraints.len());
    Ok(constraints)
}

/// Base tables of `schema`.
pub async fn list_tables(client: &Client, schema: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[&schema],
        )
        .await?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}
