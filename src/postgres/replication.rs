//! Replication slot and publication handling on the collecting side.

use async_trait::async_trait;
use bytes::Bytes;
use postgres_protocol::escape::escape_identifier;
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Client;
use tracing::{debug, info};

use super::catalog::{self, ConstraintMetadata};
use super::connection::PgConnection;
use super::message::{CustomMessage, RawMessage};
use crate::config::{CollectorConfig, SchemaConfig};
use crate::{Error, Result};

/// Prefix of the logical message marking a transaction written by a processor.
pub const MARKER_PREFIX: &str = "mirror";

/// Content of the logical message marking a transaction written by a processor.
pub const SKIP_TRANSACTION: &str = "skip-transaction";

/// True when `message` is the marker a processor writes into every
/// transaction it applies. Collectors drop such transactions so changes do
/// not bounce back and forth between mirrored databases.
pub fn is_skip_marker(message: &CustomMessage) -> bool {
    message.prefix == MARKER_PREFIX && message.content.as_ref() == SKIP_TRANSACTION.as_bytes()
}

/// Writes the loop-prevention marker into the open transaction.
pub async fn emit_skip_marker(transaction: &tokio_postgres::Transaction<'_>) -> Result<()> {
    transaction
        .execute(
            "SELECT 1 FROM pg_logical_emit_message(true, $1::text, $2::text)",
            &[&MARKER_PREFIX, &SKIP_TRANSACTION],
        )
        .await?;
    Ok(())
}

/// Where a collector reads changes from.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Creates the publication and slot if needed and brings the
    /// publication's table list in line with the configuration.
    async fn setup(&self) -> Result<()>;

    /// `pg_type` oid to type name.
    async fn load_types(&self) -> Result<HashMap<u32, String>>;

    /// Primary key and unique constraints of the tables in `schema`, keyed
    /// by `schema.table`.
    async fn load_constraints(&self, schema: &str) -> Result<HashMap<String, Vec<ConstraintMetadata>>>;

    /// Reads up to `max` pending messages without consuming them.
    async fn peek(&self, max: u32) -> Result<Vec<RawMessage>>;

    /// Consumes every pending message up to and including the transaction
    /// committed at `upto_lsn`.
    async fn consume(&self, upto_lsn: &str) -> Result<()>;
}

/// [`ChangeSource`] backed by a logical replication slot using pgoutput.
pub struct PgChangeSource {
    pg_config: tokio_postgres::Config,
    slot_name: String,
    publication: String,
    schemas: Vec<SchemaConfig>,
    connection: Mutex<Option<PgConnection>>,
}

impl PgChangeSource {
    pub fn new(pg_config: tokio_postgres::Config, config: &CollectorConfig) -> Self {
        Self {
            pg_config,
            slot_name: config.slot_name.clone(),
            publication: config.publication.clone(),
            schemas: config.schemas.clone(),
            connection: Mutex::new(None),
        }
    }

    /// The shared connection, reopened if the previous one died.
    async fn connection(&self) -> Result<MutexGuard<'_, Option<PgConnection>>> {
        let mut guard = self.connection.lock().await;

        if guard.as_ref().map_or(true, PgConnection::is_closed) {
            *guard = Some(PgConnection::connect(&self.pg_config).await?);
        }

        Ok(guard)
    }

    async fn ensure_publication(&self, client: &Client) -> Result<()> {
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&self.publication],
            )
            .await?
            .is_some();

        if !exists {
            info!("Creating publication: {}", self.publication);
            client
                .batch_execute(&format!(
                    "CREATE PUBLICATION {}",
                    escape_identifier(&self.publication)
                ))
                .await?;
        }
        Ok(())
    }

    async fn ensure_slot(&self, client: &Client) -> Result<()> {
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot_name],
            )
            .await?
            .is_some();

        if !exists {
            info!("Creating replication slot: {}", self.slot_name);
            client
                .execute(
                    "SELECT 1 FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                    &[&self.slot_name],
                )
                .await?;
        }
        Ok(())
    }

    async fn sync_schema_tables(&self, client: &Client, schema: &SchemaConfig) -> Result<()> {
        let existing = catalog::list_tables(client, &schema.name).await?;
        let included = schema.included_tables(&existing);

        for table in &included {
            if !existing.contains(table) {
                return Err(Error::Setup(format!(
                    "included table {}.{} does not exist",
                    schema.name, table
                )));
            }
        }

        let published: Vec<String> = client
            .query(
                "SELECT tablename::text FROM pg_publication_tables \
                 WHERE pubname = $1 AND schemaname = $2",
                &[&self.publication, &schema.name],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let publication = escape_identifier(&self.publication);

        for table in included.iter().filter(|t| !published.contains(t)) {
            info!("Adding {}.{} to publication {}", schema.name, table, self.publication);
            client
                .batch_execute(&format!(
                    "ALTER PUBLICATION {} ADD TABLE {}",
                    publication,
                    qualified_name(&schema.name, table)
                ))
                .await?;
        }

        for table in published.iter().filter(|t| !included.contains(t)) {
            info!("Removing {}.{} from publication {}", schema.name, table, self.publication);
            client
                .batch_execute(&format!(
                    "ALTER PUBLICATION {} DROP TABLE {}",
                    publication,
                    qualified_name(&schema.name, table)
                ))
                .await?;
        }

        if included.is_empty() {
            return Ok(());
        }

        let lacking_full_identity: Vec<String> = client
            .query(
                "SELECT c.relname::text FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = ANY($2) AND c.relreplident <> 'f'",
                &[&schema.name, &included],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        for table in lacking_full_identity {
            info!("Setting replica identity full on {}.{}", schema.name, table);
            client
                .batch_execute(&format!(
                    "ALTER TABLE {} REPLICA IDENTITY FULL",
                    qualified_name(&schema.name, &table)
                ))
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn setup(&self) -> Result<()> {
        let conn = self.connection().await?;
        let client = connected(&conn)?;

        self.ensure_publication(client).await?;
        self.ensure_slot(client).await?;

        for schema in &self.schemas {
            self.sync_schema_tables(client, schema).await?;
        }

        Ok(())
    }

    async fn load_types(&self) -> Result<HashMap<u32, String>> {
        let conn = self.connection().await?;
        catalog::load_types(connected(&conn)?).await
    }

    async fn load_constraints(&self, schema: &str) -> Result<HashMap<String, Vec<ConstraintMetadata>>> {
        let conn = self.connection().await?;
        catalog::load_constraints(connected(&conn)?, schema).await
    }

    async fn peek(&self, max: u32) -> Result<Vec<RawMessage>> {
        let conn = self.connection().await?;
        let max = i32::try_from(max).unwrap_or(i32::MAX);

        let rows = connected(&conn)?
            .query(
                "SELECT lsn::text, xid::text, data \
                 FROM pg_logical_slot_peek_binary_changes($1, NULL, $2, \
                 'messages', 'true', 'proto_version', '1', 'publication_names', $3)",
                &[&self.slot_name, &max, &self.publication],
            )
            .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: String = row.get(0);
            let xid: String = row.get(1);
            let data: Vec<u8> = row.get(2);
            let xid = xid
                .parse::<u32>()
                .map_err(|_| Error::Protocol(format!("invalid xid '{}' at {}", xid, lsn)))?;
            messages.push(RawMessage::new(lsn, xid, Bytes::from(data)));
        }

        debug!("Peeked {} messages from slot {}", messages.len(), self.slot_name);
        Ok(messages)
    }

    async fn consume(&self, upto_lsn: &str) -> Result<()> {
        let conn = self.connection().await?;

        connected(&conn)?
            .execute(
                "SELECT 1 FROM pg_logical_slot_get_binary_changes($1, $2::text::pg_lsn, NULL, \
                 'messages', 'true', 'proto_version', '1', 'publication_names', $3)",
                &[&self.slot_name, &upto_lsn, &self.publication],
            )
            .await?;

        debug!("Consumed slot {} up to {}", self.slot_name, upto_lsn);
        Ok(())
    }
}

fn connected(connection: &Option<PgConnection>) -> Result<&Client> {
    connection
        .as_ref()
        .map(PgConnection::client)
        .ok_or_else(|| Error::IllegalState("replication connection unavailable".into()))
}

fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(table))
}
