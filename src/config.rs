use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Database whose changes are collected.
    pub source: ConnectionConfig,
    /// Database the changes are replayed on.
    pub destination: ConnectionConfig,
    pub collector: CollectorConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    /// Name stamped on every transaction, used by processors to track what
    /// they already applied from this source.
    #[serde(default = "default_source_name")]
    pub source_name: String,
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    #[serde(default = "default_publication")]
    pub publication: String,
    #[serde(default = "default_max_changes_per_poll")]
    pub max_changes_per_poll: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_backoff_increase_ms")]
    pub backoff_increase_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub schemas: Vec<SchemaConfig>,
    #[serde(default)]
    pub tables: Vec<CollectorTableConfig>,
}

/// Which tables of a schema are replicated.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SchemaConfig {
    pub name: String,
    #[serde(default)]
    pub include_all: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorTableConfig {
    /// `schema.table`
    pub name: String,
    /// Constraint whose columns identify rows of a table with full replica
    /// identity, when the default choice is not wanted.
    #[serde(default)]
    pub preferred_constraint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub tables: Vec<ProcessorTableConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorTableConfig {
    /// `schema.table`
    pub name: String,
    #[serde(default)]
    pub insert_conflict_strategy: InsertConflictStrategy,
    #[serde(default)]
    pub insert_conflict_constraint: Option<String>,
}

/// What an insert does when it hits an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InsertConflictStrategy {
    #[default]
    Fail,
    DoNothing,
    Update,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_MIRROR")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.collector.validate()?;
        self.processor.validate()
    }
}

impl ConnectionConfig {
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .application_name("pg-mirror")
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        config
    }
}

impl CollectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_increase(&self) -> Duration {
        Duration::from_millis(self.backoff_increase_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn preferred_constraint(&self, full_table_name: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.name == full_table_name)
            .and_then(|t| t.preferred_constraint.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_changes_per_poll == 0 {
            return Err(Error::Config("max_changes_per_poll must be positive".into()));
        }
        if self.backoff_increase_ms == 0 {
            return Err(Error::Config("backoff_increase_ms must be positive".into()));
        }
        if self.max_backoff_ms < self.backoff_increase_ms {
            return Err(Error::Config(
                "max_backoff_ms must be at least backoff_increase_ms".into(),
            ));
        }
        for table in &self.tables {
            check_table_name(&table.name)?;
        }
        Ok(())
    }
}

impl ProcessorConfig {
    pub fn table(&self, full_table_name: &str) -> Option<&ProcessorTableConfig> {
        self.tables.iter().find(|t| t.name == full_table_name)
    }

    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            check_table_name(&table.name)?;
            if table.insert_conflict_strategy != InsertConflictStrategy::Fail
                && table.insert_conflict_constraint.is_none()
            {
                return Err(Error::Config(format!(
                    "table '{}' needs insert_conflict_constraint for strategy {:?}",
                    table.name, table.insert_conflict_strategy
                )));
            }
        }
        Ok(())
    }
}

impl SchemaConfig {
    /// Applies include and exclude lists to the tables found in the schema.
    pub fn included_tables(&self, existing: &[String]) -> Vec<String> {
        let candidates: Vec<String> = if self.include_all {
            existing.to_vec()
        } else {
            self.include.clone()
        };

        candidates
            .into_iter()
            .filter(|t| !self.exclude.contains(t))
            .collect()
    }
}

fn check_table_name(name: &str) -> Result<()> {
    match name.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => Ok(()),
        _ => Err(Error::Config(format!(
            "table '{}' must be given as schema.table",
            name
        ))),
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_source_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "mirror".to_string())
}

fn default_slot_name() -> String {
    "mirror".to_string()
}

fn default_publication() -> String {
    "mirror".to_string()
}

fn default_max_changes_per_poll() -> u32 {
    500
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_backoff_increase_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}
