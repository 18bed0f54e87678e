use async_trait::async_trait;

use crate::event::Transaction;
use crate::Result;

/// Downstream receiver of collected transactions.
///
/// A collector calls `consume` once per transaction, strictly in commit
/// order, and only advances its replication slot past a transaction after
/// `consume` returned `Ok`. Implementations must therefore tolerate seeing
/// the same transaction more than once.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn consume(&self, transaction: &Transaction) -> Result<()>;
}
