//! Crash recovery: a redo/undo protocol over a totally ordered log stream.
//!
//! Log records describe logical key/value effects keyed by transaction.
//! Recovery replays the stream forward from the last checkpoint (redo),
//! then walks the `prev_lsn` chains of transactions that never committed
//! and inverse-applies their records (undo). The recovery manager operates
//! on an in-memory table; the database's startup sequence flushes the
//! affected pages through the normal buffer-pool interface afterwards.

#[cfg(test)]
mod tests;

mod log_file;

pub use log_file::LogFile;

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Mutex;

use ahash::RandomState;
use common::{Lsn, TxnId};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

type Map<K, V> = HashMap<K, V, RandomState>;

/// The logical effect a log record describes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOp<K, V> {
    Insert { key: K, value: V },
    Delete { key: K, old_value: V },
    Update { old_key: K, old_value: V, new_key: K, new_value: V },
    Begin,
    Commit,
    Abort,
}

/// One log record. `prev_lsn` links records of the same transaction into a
/// backward chain ending at its `Begin`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord<K, V> {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: TxnId,
    pub op: LogOp<K, V>,
}

struct LogAlloc {
    next_lsn: i64,
    prev_lsn: Map<TxnId, Lsn>,
}

/// Mints log records: owns the global LSN counter and the per-transaction
/// `prev_lsn` chain heads, updating both atomically per allocation.
pub struct LogManager {
    inner: Mutex<LogAlloc>,
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LogManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogAlloc {
                next_lsn: 0,
                prev_lsn: Map::default(),
            }),
        }
    }

    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.inner.lock().expect("log latch poisoned").next_lsn)
    }

    fn allocate(&self, txn_id: TxnId) -> (Lsn, Lsn) {
        let mut inner = self.inner.lock().expect("log latch poisoned");
        let lsn = Lsn(inner.next_lsn);
        inner.next_lsn += 1;
        let prev = inner.prev_lsn.insert(txn_id, lsn).unwrap_or(Lsn::INVALID);
        (lsn, prev)
    }

    fn record<K, V>(&self, txn_id: TxnId, op: LogOp<K, V>) -> LogRecord<K, V> {
        let (lsn, prev_lsn) = self.allocate(txn_id);
        LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            op,
        }
    }

    pub fn begin_record<K, V>(&self, txn_id: TxnId) -> LogRecord<K, V> {
        self.record(txn_id, LogOp::Begin)
    }

    pub fn insert_record<K, V>(&self, txn_id: TxnId, key: K, value: V) -> LogRecord<K, V> {
        self.record(txn_id, LogOp::Insert { key, value })
    }

    pub fn delete_record<K, V>(&self, txn_id: TxnId, key: K, old_value: V) -> LogRecord<K, V> {
        self.record(txn_id, LogOp::Delete { key, old_value })
    }

    pub fn update_record<K, V>(
        &self,
        txn_id: TxnId,
        old_key: K,
        old_value: V,
        new_key: K,
        new_value: V,
    ) -> LogRecord<K, V> {
        self.record(
            txn_id,
            LogOp::Update {
                old_key,
                old_value,
                new_key,
                new_value,
            },
        )
    }

    pub fn commit_record<K, V>(&self, txn_id: TxnId) -> LogRecord<K, V> {
        self.record(txn_id, LogOp::Commit)
    }

    pub fn abort_record<K, V>(&self, txn_id: TxnId) -> LogRecord<K, V> {
        self.record(txn_id, LogOp::Abort)
    }
}

/// A consistent snapshot: the LSN it covers, the transactions live at that
/// point (with their last LSN), and the data as of the snapshot.
#[derive(Clone, Debug)]
pub struct CheckPoint<K, V> {
    pub checkpoint_lsn: Lsn,
    pub active_txns: Map<TxnId, Lsn>,
    pub persist_data: Map<K, V>,
}

impl<K: Eq + Hash, V> CheckPoint<K, V> {
    pub fn new(checkpoint_lsn: Lsn) -> Self {
        Self {
            checkpoint_lsn,
            active_txns: Map::default(),
            persist_data: Map::default(),
        }
    }

    pub fn add_active_txn(&mut self, txn_id: TxnId, last_lsn: Lsn) {
        self.active_txns.insert(txn_id, last_lsn);
    }

    pub fn add_data(&mut self, key: K, value: V) {
        self.persist_data.insert(key, value);
    }
}

/// Replays a log stream against an in-memory table.
pub struct RecoveryManager<K, V> {
    log: BTreeMap<i64, LogRecord<K, V>>,
    persist_lsn: Lsn,
    active_txns: Map<TxnId, Lsn>,
    data: Map<K, V>,
}

impl<K, V> Default for RecoveryManager<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RecoveryManager<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            log: BTreeMap::new(),
            persist_lsn: Lsn::INVALID,
            active_txns: Map::default(),
            data: Map::default(),
        }
    }

    /// Seed state from the last checkpoint.
    pub fn init(&mut self, checkpoint: CheckPoint<K, V>) {
        self.persist_lsn = checkpoint.checkpoint_lsn;
        self.active_txns = checkpoint.active_txns;
        self.data = checkpoint.persist_data;
    }

    /// Feed one record of the replay-only log stream.
    pub fn append_log_record(&mut self, record: LogRecord<K, V>) {
        self.log.insert(record.lsn.0, record);
    }

    /// Roll the table forward: apply every record past the checkpoint in
    /// LSN order, tracking the last LSN of each live transaction. An abort
    /// record rolls its transaction back immediately.
    pub fn redo_phase(&mut self) {
        let records: Vec<LogRecord<K, V>> = self
            .log
            .values()
            .filter(|r| r.lsn > self.persist_lsn)
            .cloned()
            .collect();
        let mut replayed = 0usize;
        for record in records {
            self.active_txns.insert(record.txn_id, record.lsn);
            replayed += 1;
            match record.op {
                LogOp::Insert { key, value } => {
                    self.data.insert(key, value);
                }
                LogOp::Delete { key, .. } => {
                    self.data.remove(&key);
                }
                LogOp::Update {
                    old_key,
                    new_key,
                    new_value,
                    ..
                } => {
                    self.data.remove(&old_key);
                    self.data.insert(new_key, new_value);
                }
                LogOp::Begin => {}
                LogOp::Commit => {
                    self.active_txns.remove(&record.txn_id);
                }
                LogOp::Abort => {
                    self.rollback(record.txn_id);
                    self.active_txns.remove(&record.txn_id);
                }
            }
        }
        info!(records = replayed, "redo phase complete");
    }

    /// Roll every loser back: transactions still active after redo walk
    /// their `prev_lsn` chain and inverse-apply each record.
    pub fn undo_phase(&mut self) {
        let losers: Vec<TxnId> = self.active_txns.keys().copied().collect();
        for txn_id in &losers {
            self.rollback(*txn_id);
        }
        self.active_txns.clear();
        info!(losers = losers.len(), "undo phase complete");
    }

    fn rollback(&mut self, txn_id: TxnId) {
        let Some(&last_lsn) = self.active_txns.get(&txn_id) else {
            return;
        };
        let mut lsn = last_lsn;
        while lsn.is_valid() {
            let Some(record) = self.log.get(&lsn.0) else {
                break;
            };
            match &record.op {
                LogOp::Begin => break,
                LogOp::Insert { key, .. } => {
                    self.data.remove(key);
                }
                LogOp::Delete { key, old_value } => {
                    self.data.insert(key.clone(), old_value.clone());
                }
                LogOp::Update {
                    old_key,
                    old_value,
                    new_key,
                    ..
                } => {
                    self.data.remove(new_key);
                    self.data.insert(old_key.clone(), old_value.clone());
                }
                LogOp::Commit | LogOp::Abort => {}
            }
            lsn = record.prev_lsn;
        }
    }

    pub fn data(&self) -> &Map<K, V> {
        &self.data
    }

    pub fn active_txns(&self) -> &Map<TxnId, Lsn> {
        &self.active_txns
    }
}
