//! Transactions and row-granularity two-phase locking.
//!
//! Locks follow strict 2PL: a transaction acquires in its growing phase,
//! moves to shrinking on the first release, and never acquires again. A
//! background sweep builds the waits-for graph from the per-row request
//! queues and aborts the newest transaction in any cycle.

#[cfg(test)]
mod tests;

mod lock_manager;

pub use lock_manager::{DeadlockDetector, LockManager, LockMode};

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use common::{DbResult, RowId, TxnId};
use hashbrown::{HashMap, HashSet};

type Map<K, V> = HashMap<K, V, RandomState>;
type Set<T> = HashSet<T, RandomState>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TxnState {
    fn from_u8(raw: u8) -> TxnState {
        match raw {
            0 => TxnState::Growing,
            1 => TxnState::Shrinking,
            2 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TxnState::Growing => 0,
            TxnState::Shrinking => 1,
            TxnState::Committed => 2,
            TxnState::Aborted => 3,
        }
    }
}

#[derive(Default)]
struct LockSets {
    shared: Set<RowId>,
    exclusive: Set<RowId>,
}

/// One transaction. The state is atomic so the deadlock detector can abort
/// a transaction that is blocked inside the lock manager.
pub struct Txn {
    id: TxnId,
    isolation: IsolationLevel,
    state: AtomicU8,
    locks: Mutex<LockSets>,
}

impl Txn {
    fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            state: AtomicU8::new(TxnState::Growing.as_u8()),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TxnState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn holds_shared(&self, rid: RowId) -> bool {
        self.locks.lock().expect("lock set poisoned").shared.contains(&rid)
    }

    pub fn holds_exclusive(&self, rid: RowId) -> bool {
        self.locks.lock().expect("lock set poisoned").exclusive.contains(&rid)
    }

    pub fn shared_lock_set(&self) -> Vec<RowId> {
        let locks = self.locks.lock().expect("lock set poisoned");
        locks.shared.iter().copied().collect()
    }

    pub fn exclusive_lock_set(&self) -> Vec<RowId> {
        let locks = self.locks.lock().expect("lock set poisoned");
        locks.exclusive.iter().copied().collect()
    }

    fn grant_shared(&self, rid: RowId) {
        self.locks.lock().expect("lock set poisoned").shared.insert(rid);
    }

    fn grant_exclusive(&self, rid: RowId) {
        self.locks.lock().expect("lock set poisoned").exclusive.insert(rid);
    }

    fn upgrade_grant(&self, rid: RowId) {
        let mut locks = self.locks.lock().expect("lock set poisoned");
        locks.shared.remove(&rid);
        locks.exclusive.insert(rid);
    }

    fn drop_grant(&self, rid: RowId) {
        let mut locks = self.locks.lock().expect("lock set poisoned");
        locks.shared.remove(&rid);
        locks.exclusive.remove(&rid);
    }
}

/// Hands out transaction ids and drives commit/abort through the lock
/// manager so every transaction releases its locks exactly once.
pub struct TxnManager {
    next_id: AtomicU32,
    lock_mgr: Arc<LockManager>,
    txns: Mutex<Map<TxnId, Arc<Txn>>>,
}

impl TxnManager {
    pub fn new(lock_mgr: Arc<LockManager>) -> Self {
        Self {
            next_id: AtomicU32::new(0),
            lock_mgr,
            txns: Mutex::new(Map::default()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Txn> {
        let id = TxnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let txn = Arc::new(Txn::new(id, isolation));
        self.txns
            .lock()
            .expect("txn table poisoned")
            .insert(id, txn.clone());
        txn
    }

    pub fn get(&self, id: TxnId) -> Option<Arc<Txn>> {
        self.txns.lock().expect("txn table poisoned").get(&id).cloned()
    }

    /// Release every lock, then mark the transaction committed.
    pub fn commit(&self, txn: &Txn) -> DbResult<()> {
        self.release_all(txn);
        txn.set_state(TxnState::Committed);
        Ok(())
    }

    /// Mark the transaction aborted and release its locks. The caller is
    /// responsible for rolling back its effects first.
    pub fn abort(&self, txn: &Txn) {
        txn.set_state(TxnState::Aborted);
        self.release_all(txn);
    }

    fn release_all(&self, txn: &Txn) {
        let mut rids = txn.shared_lock_set();
        rids.extend(txn.exclusive_lock_set());
        for rid in rids {
            self.lock_mgr.unlock(txn, rid);
        }
    }
}
