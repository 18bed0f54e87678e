//! Polls a replication slot and hands complete transactions to a sink.
//!
//! Messages are only *peeked* from the slot until the sink accepted the
//! transaction they belong to; then the slot is advanced past it. A sink
//! outage therefore never loses changes, at the price of possibly
//! delivering a transaction twice after a crash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::CollectorConfig;
use crate::event::Transaction;
use crate::postgres::assembler::{self, TransactionBlock};
use crate::postgres::catalog::identifying_constraint;
use crate::postgres::codec::pg_timestamp_to_utc;
use crate::postgres::decoder;
use crate::postgres::message::Message;
use crate::postgres::registry::Registry;
use crate::postgres::replication::{is_skip_marker, ChangeSource};
use crate::sink::Sink;
use crate::{Error, Result};

/// Linear backoff: each failure adds a fixed increment up to a cap, a
/// success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    increment: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(increment: Duration, max: Duration) -> Self {
        Self {
            increment,
            max,
            current: Duration::ZERO,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Records a failure and returns how long to wait.
    pub fn increase(&mut self) -> Duration {
        self.current = (self.current + self.increment).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

struct RunningPoller {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Collects changes from one source database.
pub struct Collector {
    config: CollectorConfig,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn Sink>,
    running: Mutex<Option<RunningPoller>>,
}

impl Collector {
    pub fn new(config: CollectorConfig, source: Arc<dyn ChangeSource>, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            source,
            sink,
            running: Mutex::new(None),
        }
    }

    /// Prepares the slot, loads metadata and starts polling. Does nothing
    /// when already running. On error the collector stays stopped.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(());
        }

        info!(
            source = %self.config.source_name,
            slot = %self.config.slot_name,
            publication = %self.config.publication,
            "Starting collector"
        );

        let registry = self.prepare().await.map_err(|e| match e {
            Error::Setup(_) => e,
            other => Error::Setup(other.to_string()),
        })?;

        let poller = Poller {
            source_name: self.config.source_name.clone(),
            max_changes: self.config.max_changes_per_poll,
            poll_interval: self.config.poll_interval(),
            backoff: Backoff::new(self.config.backoff_increase(), self.config.max_backoff()),
            source: Arc::clone(&self.source),
            sink: Arc::clone(&self.sink),
            registry,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(shutdown_rx));
        *running = Some(RunningPoller { shutdown, handle });

        Ok(())
    }

    /// Stops polling. A cycle in progress is allowed to finish; a pending
    /// sleep is cut short.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            warn!("Collector task ended abnormally: {}", e);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    async fn prepare(&self) -> Result<Registry> {
        self.source.setup().await?;

        debug!("Collecting metadata");
        let types = self.source.load_types().await?;

        let mut identities = HashMap::new();
        let mut known_tables = Vec::new();
        for schema in &self.config.schemas {
            for (table, constraints) in self.source.load_constraints(&schema.name).await? {
                let preferred = self.config.preferred_constraint(&table);
                if let Some(constraint) = identifying_constraint(&table, &constraints, preferred)? {
                    debug!("Rows of {} are identified by {}", table, constraint.name);
                    identities.insert(table.clone(), constraint.columns.clone());
                }
                known_tables.push(table);
            }
        }

        for table in &self.config.tables {
            if let Some(preferred) = &table.preferred_constraint {
                if !known_tables.contains(&table.name) {
                    return Err(Error::Setup(format!(
                        "unable to find constraint '{}' on table {}",
                        preferred, table.name
                    )));
                }
            }
        }

        Ok(Registry::new(types).with_identities(identities))
    }
}

/// State owned by the polling task.
struct Poller {
    source_name: String,
    max_changes: u32,
    poll_interval: Duration,
    backoff: Backoff,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn Sink>,
    registry: Registry,
}

impl Poller {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(source = %self.source_name, "Collector running");

        while !*shutdown.borrow() {
            let delay = match self.poll_once().await {
                Ok(delivered) => {
                    if delivered > 0 {
                        debug!(source = %self.source_name, "Delivered {} transactions", delivered);
                    }
                    self.backoff.reset();
                    self.poll_interval
                }
                Err(e) => {
                    let delay = self.backoff.increase();
                    let backoff_ms = delay.as_millis() as u64;
                    if e.is_fatal() {
                        error!(
                            source = %self.source_name,
                            error = %e,
                            backoff_ms,
                            "Cannot collect changes until the input or configuration is fixed"
                        );
                    } else {
                        warn!(
                            source = %self.source_name,
                            error = %e,
                            backoff_ms,
                            "Failed to collect changes"
                        );
                    }
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(source = %self.source_name, "Collector stopped");
    }

    /// One peek/deliver/consume cycle. Returns the number of transactions
    /// handed to the sink.
    async fn poll_once(&mut self) -> Result<usize> {
        let raw = self.source.peek(self.max_changes).await?;
        if raw.is_empty() {
            return Ok(0);
        }

        // Decode everything before delivering anything: a malformed payload
        // aborts the cycle with the slot untouched.
        let mut messages = Vec::with_capacity(raw.len());
        for message in &raw {
            if let Some(decoded) = decoder::decode(message)? {
                messages.push(decoded);
            }
        }

        let blocks = assembler::assemble(messages);

        let mut handled_upto = None;
        let result = self.deliver(&blocks, &mut handled_upto).await;

        if let Some(lsn) = handled_upto {
            if let Err(e) = self.source.consume(&lsn).await {
                if result.is_ok() {
                    return Err(e);
                }
                warn!("Failed to consume delivered transactions: {}", e);
            }
        }

        result
    }

    /// Delivers complete transactions in order, recording the commit
    /// position of the last one handled. Stops at the first failure.
    async fn deliver(
        &mut self,
        blocks: &[TransactionBlock],
        handled_upto: &mut Option<String>,
    ) -> Result<usize> {
        let mut delivered = 0;

        for block in blocks {
            if is_standalone_messages(block) {
                continue;
            }

            let Some((commit_lsn, commit)) = block.commit() else {
                debug!(xid = block.xid, "Transaction incomplete, waiting for the rest");
                break;
            };

            if carries_skip_marker(block) {
                trace!(xid = block.xid, "Skipping mirrored transaction");
                for relation in block.relations() {
                    self.registry.observe_relation(relation);
                }
                *handled_upto = Some(commit_lsn.to_string());
                continue;
            }

            let events = assembler::to_events(block, &mut self.registry)?;
            if events.is_empty() {
                *handled_upto = Some(commit_lsn.to_string());
                continue;
            }

            let transaction = Transaction::new(
                self.source_name.as_str(),
                events,
                pg_timestamp_to_utc(commit.commit_timestamp)?,
            );

            self.sink.consume(&transaction).await?;

            trace!(
                xid = block.xid,
                events = transaction.events.len(),
                "Delivered transaction"
            );
            *handled_upto = Some(commit_lsn.to_string());
            delivered += 1;
        }

        Ok(delivered)
    }
}

fn carries_skip_marker(block: &TransactionBlock) -> bool {
    block.messages.iter().any(|m| match &m.message {
        Message::Custom(custom) => is_skip_marker(custom),
        _ => false,
    })
}

/// Non-transactional logical messages arrive outside any BEGIN/COMMIT.
fn is_standalone_messages(block: &TransactionBlock) -> bool {
    block.messages.iter().all(|m| match &m.message {
        Message::Custom(custom) => !custom.transactional,
        _ => false,
    })
}
