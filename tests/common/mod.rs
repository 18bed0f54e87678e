#![allow(dead_code)]

use async_trait::async_trait;
use pg_mirror::config::{CollectorConfig, ConnectionConfig, SchemaConfig};
use pg_mirror::{Sink, Transaction};
use std::env;
use std::sync::Mutex;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

/// Test database from environment variables. The server must run with
/// `wal_level = logical`.
pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    }
}

/// Second database on the same server, the target of end-to-end mirroring.
pub fn mirror_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        database: env::var("TEST_PG_MIRROR_DATABASE")
            .unwrap_or_else(|_| "pg_mirror_destination".to_string()),
        ..connection_config()
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("pg_mirror=debug")
        .try_init()
        .ok();
}

pub async fn connect() -> Client {
    connect_to(&connection_config()).await
}

pub async fn connect_to(config: &ConnectionConfig) -> Client {
    let (client, connection) = config
        .pg_config()
        .connect(NoTls)
        .await
        .expect("Failed to connect to test database");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    client
}

/// Name unique to this test run, safe as an unquoted identifier.
pub fn unique_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..8])
}

/// Creates a fresh schema and returns its name.
pub async fn create_schema(client: &Client) -> String {
    let schema = unique_name("mirror_test");
    client
        .batch_execute(&format!("CREATE SCHEMA {}", schema))
        .await
        .expect("Failed to create schema");
    schema
}

/// Creates the mirror database unless it already exists and connects to it.
pub async fn connect_mirror(client: &Client) -> Client {
    let config = mirror_connection_config();
    let exists = client
        .query_opt(
            "SELECT 1 FROM pg_database WHERE datname = $1",
            &[&config.database],
        )
        .await
        .expect("Failed to look up mirror database")
        .is_some();

    if !exists {
        client
            .batch_execute(&format!("CREATE DATABASE {}", config.database))
            .await
            .expect("Failed to create mirror database");
    }

    connect_to(&config).await
}

pub fn collector_config(schema: &str) -> CollectorConfig {
    CollectorConfig {
        source_name: "test-source".to_string(),
        slot_name: unique_name("slot"),
        publication: unique_name("pub"),
        max_changes_per_poll: 500,
        poll_interval_ms: 100,
        backoff_increase_ms: 100,
        max_backoff_ms: 500,
        schemas: vec![SchemaConfig {
            name: schema.to_string(),
            include_all: true,
            ..Default::default()
        }],
        tables: Vec::new(),
    }
}

pub async fn cleanup(client: &Client, schema: &str, config: &CollectorConfig) {
    let _ = client
        .execute(
            "SELECT pg_drop_replication_slot($1) FROM pg_replication_slots WHERE slot_name = $1",
            &[&config.slot_name],
        )
        .await;
    let _ = client
        .batch_execute(&format!("DROP PUBLICATION IF EXISTS {}", config.publication))
        .await;
    let _ = client
        .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .await;
}

/// Keeps every transaction it is handed.
#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Transaction>>,
}

impl RecordingSink {
    pub fn received(&self) -> Vec<Transaction> {
        self.received.lock().unwrap().clone()
    }

    /// Polls until `count` transactions arrived or the timeout passed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Transaction> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.received.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.received()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn consume(&self, transaction: &Transaction) -> pg_mirror::Result<()> {
        self.received.lock().unwrap().push(transaction.clone());
        Ok(())
    }
}
