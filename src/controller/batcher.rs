//! Config transaction batching
//!
//! The device delivers a configuration commit as a burst of config events
//! followed by a `.commit.end` sentinel. Events are buffered per path in the
//! current [`Transaction`]; the sentinel flushes the transaction and starts a
//! fresh one, so no entry ever survives into the next commit. Entries that
//! never see a sentinel are never applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::device::{ConfigEvent, ConfigOperation, Notification};
use crate::error::Result;

/// Path of the event that closes a config transaction
pub const COMMIT_END_PATH: &str = ".commit.end";

/// One buffered config operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigTransactionEntry {
    pub op: ConfigOperation,
    pub path: String,
    pub keys: Vec<String>,
    pub payload: Option<String>,
}

impl From<ConfigEvent> for ConfigTransactionEntry {
    fn from(event: ConfigEvent) -> Self {
        Self {
            op: event.op,
            path: event.path,
            keys: event.keys,
            payload: event.payload,
        }
    }
}

/// Entries buffered between two commit sentinels
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    next_seq: u64,
    entries: BTreeMap<String, Vec<(u64, ConfigTransactionEntry)>>,
}

impl Transaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            next_seq: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of buffered entries across all paths
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&mut self, entry: ConfigTransactionEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .entry(entry.path.clone())
            .or_default()
            .push((seq, entry));
    }

    /// Close the transaction, returning entries under `roots` in arrival order
    fn flush(self, roots: &[String]) -> CommittedTransaction {
        let mut selected = Vec::new();
        let mut dropped = 0;
        for (path, entries) in self.entries {
            if roots.iter().any(|root| is_under_root(&path, root)) {
                selected.extend(entries);
            } else {
                dropped += entries.len();
            }
        }
        selected.sort_by_key(|(seq, _)| *seq);

        CommittedTransaction {
            id: self.id,
            entries: selected.into_iter().map(|(_, e)| e).collect(),
            dropped,
        }
    }
}

/// Result of a commit
#[derive(Debug, PartialEq, Eq)]
pub struct CommittedTransaction {
    pub id: u64,
    /// Entries under a watched root, in arrival order
    pub entries: Vec<ConfigTransactionEntry>,
    /// Entries discarded because no watched root covers their path
    pub dropped: usize,
}

fn is_under_root(path: &str, root: &str) -> bool {
    match path.strip_prefix(root) {
        Some("") => true,
        Some(rest) => rest.starts_with('.') || rest.starts_with('{'),
        None => false,
    }
}

/// Accumulates config events until a commit sentinel arrives
#[derive(Debug)]
pub struct TransactionBatcher {
    roots: Vec<String>,
    current: Transaction,
}

impl TransactionBatcher {
    /// `roots` are the config roots whose entries are applied on commit
    pub fn new(roots: Vec<String>) -> Self {
        Self {
            roots,
            current: Transaction::new(1),
        }
    }

    pub fn is_commit_boundary(path: &str) -> bool {
        path == COMMIT_END_PATH
    }

    pub fn current(&self) -> &Transaction {
        &self.current
    }

    pub fn record(&mut self, entry: ConfigTransactionEntry) {
        self.current.record(entry);
    }

    /// Flush the current transaction if `path` is the commit sentinel.
    ///
    /// The buffer is replaced before the entries are handed back, so a
    /// failing handler cannot leak entries into the next transaction.
    pub fn try_commit(&mut self, path: &str) -> Option<CommittedTransaction> {
        if !Self::is_commit_boundary(path) {
            return None;
        }
        let next = Transaction::new(self.current.id + 1);
        let flushed = std::mem::replace(&mut self.current, next);
        Some(flushed.flush(&self.roots))
    }
}

/// Applies committed config entries
#[async_trait]
pub trait ConfigHandler: Send + Sync {
    async fn handle(&self, entry: &ConfigTransactionEntry) -> Result<()>;
}

/// Routes notification items through the batcher to a [`ConfigHandler`]
pub struct ConfigDispatcher {
    batcher: TransactionBatcher,
    handler: Arc<dyn ConfigHandler>,
}

impl ConfigDispatcher {
    pub fn new(batcher: TransactionBatcher, handler: Arc<dyn ConfigHandler>) -> Self {
        Self { batcher, handler }
    }

    pub fn batcher(&self) -> &TransactionBatcher {
        &self.batcher
    }

    /// Handle one notification item.
    ///
    /// Only a fatal handler error is returned; anything else is logged and
    /// the remaining entries of the transaction are still applied.
    pub async fn dispatch(&mut self, notification: Notification) -> Result<()> {
        let event = match notification {
            Notification::Config(event) => event,
            Notification::Unhandled(kind) => {
                debug!("Got unhandled notification: {}", kind);
                return Ok(());
            }
        };

        let Some(committed) = self.batcher.try_commit(&event.path) else {
            debug!("Buffering {} for {}", event.op, event.path);
            self.batcher.record(event.into());
            return Ok(());
        };

        info!(
            "Applying config transaction {}: {} entries ({} outside watched roots dropped)",
            committed.id,
            committed.entries.len(),
            committed.dropped
        );
        #[cfg(feature = "metrics")]
        super::metrics::inc_config_transaction();

        for entry in &committed.entries {
            if let Err(e) = self.handler.handle(entry).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(
                    "Failed to apply {} on {} in transaction {}: {}",
                    entry.op, entry.path, committed.id, e
                );
            }
        }
        Ok(())
    }
}
