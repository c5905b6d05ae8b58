use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use common::{AbortReason, DbError, DbResult, RowId, TxnId};
use tracing::warn;

use crate::{IsolationLevel, Txn, TxnManager, TxnState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: Option<LockMode>,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: None,
        }
    }
}

struct LockRequestQueue {
    requests: Vec<LockRequest>,
    cv: Arc<Condvar>,
    sharing_cnt: u32,
    is_writing: bool,
    is_upgrading: bool,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            cv: Arc::new(Condvar::new()),
            sharing_cnt: 0,
            is_writing: false,
            is_upgrading: false,
        }
    }
}

#[derive(Default)]
struct LockTable {
    rows: BTreeMap<RowId, LockRequestQueue>,
    waits_for: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

/// Row-granularity shared/exclusive lock manager.
///
/// One mutex guards the whole table; each row queue carries its own condvar
/// which always waits against that mutex. Blocked acquirers re-check their
/// transaction's state on every wakeup so a detector-side abort unblocks
/// them with the `Deadlock` reason.
pub struct LockManager {
    latch: Mutex<LockTable>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            latch: Mutex::new(LockTable::default()),
        }
    }

    /// Acquire a shared lock on `rid`, blocking while a writer holds it.
    pub fn lock_shared(&self, txn: &Txn, rid: RowId) -> DbResult<()> {
        if txn.isolation() == IsolationLevel::ReadUncommitted {
            return Err(abort_now(txn, AbortReason::SharedOnReadUncommitted));
        }
        let mut table = self.latch.lock().expect("lock latch poisoned");
        prepare(txn)?;
        table
            .rows
            .entry(rid)
            .or_default()
            .requests
            .push(LockRequest::new(txn.id(), LockMode::Shared));

        loop {
            if txn.state() == TxnState::Aborted {
                cancel_request(&mut table, rid, txn.id());
                return Err(DbError::TxnAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            let queue = table.rows.get_mut(&rid).expect("queue exists while requested");
            if !queue.is_writing {
                queue.sharing_cnt += 1;
                set_granted(queue, txn.id(), LockMode::Shared);
                txn.grant_shared(rid);
                return Ok(());
            }
            let cv = queue.cv.clone();
            table = cv.wait(table).expect("lock latch poisoned");
        }
    }

    /// Acquire an exclusive lock on `rid`, blocking while any other grant
    /// is outstanding.
    pub fn lock_exclusive(&self, txn: &Txn, rid: RowId) -> DbResult<()> {
        let mut table = self.latch.lock().expect("lock latch poisoned");
        prepare(txn)?;
        table
            .rows
            .entry(rid)
            .or_default()
            .requests
            .push(LockRequest::new(txn.id(), LockMode::Exclusive));

        loop {
            if txn.state() == TxnState::Aborted {
                cancel_request(&mut table, rid, txn.id());
                return Err(DbError::TxnAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            let queue = table.rows.get_mut(&rid).expect("queue exists while requested");
            if !queue.is_writing && queue.sharing_cnt == 0 {
                queue.is_writing = true;
                set_granted(queue, txn.id(), LockMode::Exclusive);
                txn.grant_exclusive(rid);
                return Ok(());
            }
            let cv = queue.cv.clone();
            table = cv.wait(table).expect("lock latch poisoned");
        }
    }

    /// Upgrade an existing shared grant to exclusive. A holder that already
    /// has the exclusive grant succeeds immediately; a second concurrent
    /// upgrade on the same row aborts with `UpgradeConflict`.
    pub fn lock_upgrade(&self, txn: &Txn, rid: RowId) -> DbResult<()> {
        let mut table = self.latch.lock().expect("lock latch poisoned");
        prepare(txn)?;
        let queue = table.rows.entry(rid).or_default();
        if queue.is_upgrading {
            return Err(abort_now(txn, AbortReason::UpgradeConflict));
        }
        let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) else {
            return Err(DbError::Failed(format!(
                "lock upgrade without a prior grant on row {rid}"
            )));
        };
        match queue.requests[pos].granted {
            Some(LockMode::Exclusive) => return Ok(()),
            Some(LockMode::Shared) => {}
            None => {
                return Err(DbError::Failed(format!(
                    "lock upgrade before the shared lock on {rid} was granted"
                )))
            }
        }
        queue.is_upgrading = true;

        loop {
            if txn.state() == TxnState::Aborted {
                let queue = table.rows.get_mut(&rid).expect("queue exists while requested");
                queue.is_upgrading = false;
                cancel_request(&mut table, rid, txn.id());
                return Err(DbError::TxnAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            let queue = table.rows.get_mut(&rid).expect("queue exists while requested");
            if !queue.is_writing && queue.sharing_cnt == 1 {
                queue.sharing_cnt -= 1;
                queue.is_writing = true;
                queue.is_upgrading = false;
                let req = queue
                    .requests
                    .iter_mut()
                    .find(|r| r.txn_id == txn.id())
                    .expect("request exists while upgrading");
                req.mode = LockMode::Exclusive;
                req.granted = Some(LockMode::Exclusive);
                txn.upgrade_grant(rid);
                return Ok(());
            }
            let cv = queue.cv.clone();
            table = cv.wait(table).expect("lock latch poisoned");
        }
    }

    /// Release this transaction's lock on `rid`. The first release moves
    /// the transaction into its shrinking phase.
    pub fn unlock(&self, txn: &Txn, rid: RowId) -> bool {
        let mut table = self.latch.lock().expect("lock latch poisoned");
        txn.drop_grant(rid);
        let Some(queue) = table.rows.get_mut(&rid) else {
            return false;
        };
        let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) else {
            return false;
        };
        let req = queue.requests.remove(pos);
        if txn.state() == TxnState::Growing {
            txn.set_state(TxnState::Shrinking);
        }
        match req.granted {
            Some(LockMode::Shared) => queue.sharing_cnt = queue.sharing_cnt.saturating_sub(1),
            Some(LockMode::Exclusive) => queue.is_writing = false,
            None => {}
        }
        queue.cv.notify_all();
        if queue.requests.is_empty() {
            table.rows.remove(&rid);
        }
        true
    }

    /// One detection sweep: rebuild the waits-for graph, abort the newest
    /// transaction of every cycle, and wake the rows it was waiting on.
    /// Returns the victims, oldest-aborted first.
    pub fn detect_deadlocks(&self, txn_mgr: &TxnManager) -> Vec<TxnId> {
        let mut table = self.latch.lock().expect("lock latch poisoned");

        let mut edges: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        let mut waiting_on: BTreeMap<TxnId, RowId> = BTreeMap::new();
        for (rid, queue) in &table.rows {
            for waiter in queue.requests.iter().filter(|r| r.granted.is_none()) {
                waiting_on.insert(waiter.txn_id, *rid);
                for holder in queue.requests.iter().filter(|r| r.granted.is_some()) {
                    edges.entry(waiter.txn_id).or_default().insert(holder.txn_id);
                }
            }
        }
        table.waits_for = edges;

        let mut victims = Vec::new();
        while let Some(victim) = has_cycle(&table.waits_for) {
            warn!(txn = victim.0, "aborting deadlock victim");
            remove_node(&mut table.waits_for, victim);
            if let Some(txn) = txn_mgr.get(victim) {
                txn.set_state(TxnState::Aborted);
            }
            if let Some(rid) = waiting_on.get(&victim) {
                if let Some(queue) = table.rows.get(rid) {
                    queue.cv.notify_all();
                }
            }
            victims.push(victim);
        }
        table.waits_for.clear();
        victims
    }

    /// Run `detect_deadlocks` on a background thread every `interval`.
    pub fn spawn_detector(
        self: &Arc<Self>,
        txn_mgr: Arc<TxnManager>,
        interval: Duration,
    ) -> DeadlockDetector {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let lock_mgr = self.clone();
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                lock_mgr.detect_deadlocks(&txn_mgr);
                std::thread::park_timeout(interval);
            }
        });
        DeadlockDetector {
            stop,
            handle: Some(handle),
        }
    }
}

/// Handle to the background detection thread; stops it on drop.
pub struct DeadlockDetector {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn prepare(txn: &Txn) -> DbResult<()> {
    if txn.state() == TxnState::Shrinking {
        return Err(abort_now(txn, AbortReason::LockOnShrinking));
    }
    Ok(())
}

fn abort_now(txn: &Txn, reason: AbortReason) -> DbError {
    txn.set_state(TxnState::Aborted);
    DbError::TxnAbort {
        txn_id: txn.id(),
        reason,
    }
}

fn set_granted(queue: &mut LockRequestQueue, txn_id: TxnId, mode: LockMode) {
    let req = queue
        .requests
        .iter_mut()
        .find(|r| r.txn_id == txn_id && r.mode == mode && r.granted.is_none())
        .expect("request exists while granting");
    req.granted = Some(mode);
}

fn cancel_request(table: &mut LockTable, rid: RowId, txn_id: TxnId) {
    let Some(queue) = table.rows.get_mut(&rid) else {
        return;
    };
    if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn_id) {
        match queue.requests.remove(pos).granted {
            Some(LockMode::Shared) => queue.sharing_cnt = queue.sharing_cnt.saturating_sub(1),
            Some(LockMode::Exclusive) => queue.is_writing = false,
            None => {}
        }
        queue.cv.notify_all();
    }
    if queue.requests.is_empty() {
        table.rows.remove(&rid);
    }
}

/// Find one cycle and return its newest member, or `None`. Starts are tried
/// newest-first so the victim choice is deterministic.
fn has_cycle(graph: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<TxnId> {
    let mut nodes: BTreeSet<TxnId> = graph.keys().copied().collect();
    for targets in graph.values() {
        nodes.extend(targets.iter().copied());
    }
    let mut visited = BTreeSet::new();
    for &start in nodes.iter().rev() {
        let mut path = Vec::new();
        if let Some(victim) = dfs(start, graph, &mut visited, &mut path) {
            return Some(victim);
        }
    }
    None
}

fn dfs(
    node: TxnId,
    graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
    visited: &mut BTreeSet<TxnId>,
    path: &mut Vec<TxnId>,
) -> Option<TxnId> {
    if let Some(idx) = path.iter().position(|&t| t == node) {
        return path[idx..].iter().copied().max();
    }
    if !visited.insert(node) {
        return None;
    }
    path.push(node);
    if let Some(targets) = graph.get(&node) {
        for &next in targets {
            if let Some(victim) = dfs(next, graph, visited, path) {
                return Some(victim);
            }
        }
    }
    path.pop();
    None
}

fn remove_node(graph: &mut BTreeMap<TxnId, BTreeSet<TxnId>>, node: TxnId) {
    graph.remove(&node);
    for targets in graph.values_mut() {
        targets.remove(&node);
    }
}
