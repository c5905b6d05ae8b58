use super::*;
use common::{AbortReason, DbError, PageId};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn managers() -> (Arc<LockManager>, Arc<TxnManager>) {
    let lock_mgr = Arc::new(LockManager::new());
    let txn_mgr = Arc::new(TxnManager::new(lock_mgr.clone()));
    (lock_mgr, txn_mgr)
}

fn rid(page: i32, slot: u32) -> RowId {
    RowId::new(PageId(page), slot)
}

#[test]
fn shared_locks_coexist() {
    let (lock_mgr, txn_mgr) = managers();
    let t1 = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let row = rid(1, 0);

    lock_mgr.lock_shared(&t1, row).unwrap();
    lock_mgr.lock_shared(&t2, row).unwrap();
    assert!(t1.holds_shared(row));
    assert!(t2.holds_shared(row));

    txn_mgr.commit(&t1).unwrap();
    txn_mgr.commit(&t2).unwrap();
}

#[test]
fn exclusive_lock_blocks_readers_until_release() {
    let (lock_mgr, txn_mgr) = managers();
    let writer = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let row = rid(1, 0);
    lock_mgr.lock_exclusive(&writer, row).unwrap();

    let reader = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let handle = {
        let lock_mgr = lock_mgr.clone();
        let reader = reader.clone();
        std::thread::spawn(move || lock_mgr.lock_shared(&reader, row))
    };

    // the reader is parked behind the writer
    std::thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    txn_mgr.commit(&writer).unwrap();
    handle.join().unwrap().unwrap();
    assert!(reader.holds_shared(row));
    txn_mgr.commit(&reader).unwrap();
}

#[test]
fn lock_after_release_aborts_on_shrinking() {
    let (lock_mgr, txn_mgr) = managers();
    let txn = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let row = rid(1, 0);

    lock_mgr.lock_exclusive(&txn, row).unwrap();
    assert!(lock_mgr.unlock(&txn, row));
    assert_eq!(txn.state(), TxnState::Shrinking);

    let err = lock_mgr.lock_exclusive(&txn, rid(1, 1)).unwrap_err();
    assert!(matches!(
        err,
        DbError::TxnAbort {
            reason: AbortReason::LockOnShrinking,
            ..
        }
    ));
    assert_eq!(txn.state(), TxnState::Aborted);
}

#[test]
fn shared_lock_under_read_uncommitted_aborts() {
    let (lock_mgr, txn_mgr) = managers();
    let txn = txn_mgr.begin(IsolationLevel::ReadUncommitted);

    let err = lock_mgr.lock_shared(&txn, rid(1, 0)).unwrap_err();
    assert!(matches!(
        err,
        DbError::TxnAbort {
            reason: AbortReason::SharedOnReadUncommitted,
            ..
        }
    ));
    assert_eq!(txn.state(), TxnState::Aborted);
}

#[test]
fn upgrade_promotes_sole_shared_holder() {
    let (lock_mgr, txn_mgr) = managers();
    let txn = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let row = rid(2, 3);

    lock_mgr.lock_shared(&txn, row).unwrap();
    lock_mgr.lock_upgrade(&txn, row).unwrap();
    assert!(txn.holds_exclusive(row));
    assert!(!txn.holds_shared(row));

    // an upgrade on an already-exclusive grant succeeds immediately
    lock_mgr.lock_upgrade(&txn, row).unwrap();
    txn_mgr.commit(&txn).unwrap();
}

#[test]
fn concurrent_upgrade_is_a_conflict() {
    let (lock_mgr, txn_mgr) = managers();
    let t1 = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let row = rid(3, 0);

    lock_mgr.lock_shared(&t1, row).unwrap();
    lock_mgr.lock_shared(&t2, row).unwrap();

    // t1's upgrade waits for t2 to release its shared lock
    let handle = {
        let lock_mgr = lock_mgr.clone();
        let t1 = t1.clone();
        std::thread::spawn(move || lock_mgr.lock_upgrade(&t1, row))
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    // a second queued upgrade aborts
    let err = lock_mgr.lock_upgrade(&t2, row).unwrap_err();
    assert!(matches!(
        err,
        DbError::TxnAbort {
            reason: AbortReason::UpgradeConflict,
            ..
        }
    ));

    txn_mgr.abort(&t2);
    handle.join().unwrap().unwrap();
    assert!(t1.holds_exclusive(row));
    txn_mgr.commit(&t1).unwrap();
}

#[test]
fn unlock_of_unheld_row_returns_false() {
    let (lock_mgr, txn_mgr) = managers();
    let txn = txn_mgr.begin(IsolationLevel::RepeatableRead);
    assert!(!lock_mgr.unlock(&txn, rid(9, 9)));
}

#[test]
fn detection_sweep_without_cycle_finds_nothing() {
    let (lock_mgr, txn_mgr) = managers();
    let t1 = txn_mgr.begin(IsolationLevel::RepeatableRead);
    lock_mgr.lock_exclusive(&t1, rid(1, 0)).unwrap();
    assert!(lock_mgr.detect_deadlocks(&txn_mgr).is_empty());
    txn_mgr.commit(&t1).unwrap();
}

#[test]
fn deadlock_aborts_the_newest_transaction() {
    let (lock_mgr, txn_mgr) = managers();
    let t1 = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_mgr.begin(IsolationLevel::RepeatableRead);
    let r1 = rid(1, 0);
    let r2 = rid(2, 0);

    lock_mgr.lock_exclusive(&t1, r1).unwrap();
    lock_mgr.lock_exclusive(&t2, r2).unwrap();

    // t1 -> r2 and t2 -> r1 close the cycle
    let older = {
        let lock_mgr = lock_mgr.clone();
        let t1 = t1.clone();
        std::thread::spawn(move || lock_mgr.lock_exclusive(&t1, r2))
    };
    let newer = {
        let lock_mgr = lock_mgr.clone();
        let txn_mgr = txn_mgr.clone();
        let t2 = t2.clone();
        std::thread::spawn(move || {
            let result = lock_mgr.lock_exclusive(&t2, r1);
            if result.is_err() {
                // the victim rolls back, releasing its grants
                txn_mgr.abort(&t2);
            }
            result
        })
    };

    let detector = lock_mgr.spawn_detector(txn_mgr.clone(), Duration::from_millis(10));

    let newer_result = newer.join().unwrap();
    assert!(matches!(
        newer_result,
        Err(DbError::TxnAbort {
            reason: AbortReason::Deadlock,
            ..
        })
    ));
    assert_eq!(t2.state(), TxnState::Aborted);

    // the survivor's blocked request completes once the victim releases
    older.join().unwrap().unwrap();
    assert!(t1.holds_exclusive(r2));

    detector.stop();
    txn_mgr.commit(&t1).unwrap();
    assert_eq!(t1.state(), TxnState::Committed);
}
