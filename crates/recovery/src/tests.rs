use super::*;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

type Rm = RecoveryManager<String, i32>;

fn k(s: &str) -> String {
    s.to_string()
}

#[test]
fn lsn_allocation_is_monotone_and_chained() {
    let log = LogManager::new();
    let t1 = TxnId(1);
    let t2 = TxnId(2);

    let begin: LogRecord<String, i32> = log.begin_record(t1);
    let insert = log.insert_record(t1, k("a"), 1);
    let other: LogRecord<String, i32> = log.begin_record(t2);
    let commit: LogRecord<String, i32> = log.commit_record(t1);

    assert_eq!(begin.lsn, Lsn(0));
    assert_eq!(insert.lsn, Lsn(1));
    assert_eq!(other.lsn, Lsn(2));
    assert_eq!(commit.lsn, Lsn(3));

    // prev_lsn chains stay per-transaction
    assert_eq!(begin.prev_lsn, Lsn::INVALID);
    assert_eq!(insert.prev_lsn, begin.lsn);
    assert_eq!(other.prev_lsn, Lsn::INVALID);
    assert_eq!(commit.prev_lsn, insert.lsn);
}

#[test]
fn redo_then_undo_rolls_back_losers() {
    // Begin T1, Insert T1 (a=1), Commit T1,
    // Begin T2, Update T2 (a: 1 -> 2), Insert T2 (b=3), no commit.
    let log = LogManager::new();
    let mut rm = Rm::new();
    let t1 = TxnId(1);
    let t2 = TxnId(2);

    rm.append_log_record(log.begin_record(t1));
    rm.append_log_record(log.insert_record(t1, k("a"), 1));
    rm.append_log_record(log.commit_record(t1));
    rm.append_log_record(log.begin_record(t2));
    rm.append_log_record(log.update_record(t2, k("a"), 1, k("a"), 2));
    rm.append_log_record(log.insert_record(t2, k("b"), 3));

    rm.redo_phase();
    assert_eq!(rm.data().get("a"), Some(&2));
    assert_eq!(rm.data().get("b"), Some(&3));
    assert!(rm.active_txns().contains_key(&t2));
    assert!(!rm.active_txns().contains_key(&t1));

    rm.undo_phase();
    assert_eq!(rm.data().len(), 1);
    assert_eq!(rm.data().get("a"), Some(&1));
    assert!(rm.active_txns().is_empty());
}

#[test]
fn redo_is_idempotent() {
    let log = LogManager::new();
    let mut rm = Rm::new();
    let t1 = TxnId(1);

    rm.append_log_record(log.begin_record(t1));
    rm.append_log_record(log.insert_record(t1, k("x"), 10));
    rm.append_log_record(log.update_record(t1, k("x"), 10, k("y"), 20));
    rm.append_log_record(log.commit_record(t1));

    rm.redo_phase();
    let first: Vec<(String, i32)> = {
        let mut all: Vec<_> = rm.data().iter().map(|(k, v)| (k.clone(), *v)).collect();
        all.sort();
        all
    };
    rm.redo_phase();
    let mut second: Vec<_> = rm.data().iter().map(|(k, v)| (k.clone(), *v)).collect();
    second.sort();
    assert_eq!(first, second);
}

#[test]
fn abort_record_rolls_back_during_redo() {
    let log = LogManager::new();
    let mut rm = Rm::new();
    let t1 = TxnId(1);

    rm.append_log_record(log.begin_record(t1));
    rm.append_log_record(log.insert_record(t1, k("gone"), 7));
    rm.append_log_record(log.delete_record(t1, k("kept"), 5));
    rm.append_log_record(log.abort_record(t1));

    let mut checkpoint = CheckPoint::new(Lsn::INVALID);
    checkpoint.add_data(k("kept"), 5);
    rm.init(checkpoint);

    rm.redo_phase();
    assert_eq!(rm.data().get("kept"), Some(&5));
    assert!(!rm.data().contains_key("gone"));
    assert!(rm.active_txns().is_empty());
}

#[test]
fn checkpoint_skips_already_persisted_records() {
    let log = LogManager::new();
    let mut rm = Rm::new();
    let t1 = TxnId(1);

    rm.append_log_record(log.begin_record(t1));
    let persisted = log.insert_record(t1, k("old"), 1);
    let persisted_lsn = persisted.lsn;
    rm.append_log_record(persisted);
    rm.append_log_record(log.insert_record(t1, k("new"), 2));
    rm.append_log_record(log.commit_record(t1));

    // the checkpoint already contains the first insert's effect
    let mut checkpoint = CheckPoint::new(persisted_lsn);
    checkpoint.add_data(k("old"), 1);
    checkpoint.add_active_txn(t1, persisted_lsn);
    rm.init(checkpoint);

    rm.redo_phase();
    rm.undo_phase();
    assert_eq!(rm.data().get("old"), Some(&1));
    assert_eq!(rm.data().get("new"), Some(&2));
}

#[test]
fn undo_walks_past_checkpoint_boundary() {
    let log = LogManager::new();
    let mut rm = Rm::new();
    let t1 = TxnId(1);

    rm.append_log_record(log.begin_record(t1));
    let before = log.insert_record(t1, k("early"), 1);
    let before_lsn = before.lsn;
    rm.append_log_record(before);
    rm.append_log_record(log.insert_record(t1, k("late"), 2));
    // t1 never commits

    let mut checkpoint = CheckPoint::new(before_lsn);
    checkpoint.add_data(k("early"), 1);
    checkpoint.add_active_txn(t1, before_lsn);
    rm.init(checkpoint);

    rm.redo_phase();
    rm.undo_phase();
    // both the replayed and the checkpointed effect are undone
    assert!(rm.data().is_empty());
}

mod log_file {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_and_replay_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let log = LogManager::new();
        let t1 = TxnId(1);

        let records: Vec<LogRecord<String, i32>> = vec![
            log.begin_record(t1),
            log.insert_record(t1, k("a"), 1),
            log.update_record(t1, k("a"), 1, k("b"), 2),
            log.commit_record(t1),
        ];

        {
            let mut file = LogFile::open(&path).unwrap();
            for record in &records {
                file.append(record).unwrap();
            }
            file.sync().unwrap();
        }

        let back: Vec<LogRecord<String, i32>> = LogFile::replay(&path).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn missing_file_replays_empty() {
        let dir = tempdir().unwrap();
        let back: Vec<LogRecord<String, i32>> =
            LogFile::replay(dir.path().join("absent.log")).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn torn_tail_frame_ends_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let log = LogManager::new();
        let t1 = TxnId(1);

        let first: LogRecord<String, i32> = log.insert_record(t1, k("ok"), 1);
        {
            let mut file = LogFile::open(&path).unwrap();
            file.append(&first).unwrap();
            file.sync().unwrap();
        }
        // simulate a torn write: a frame header promising more than exists
        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(&[200, 0, 0, 0, 1, 2, 3, 4, 9]).unwrap();
        }

        let back: Vec<LogRecord<String, i32>> = LogFile::replay(&path).unwrap();
        assert_eq!(back, vec![first]);
    }

    #[test]
    fn corrupt_checksum_ends_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let log = LogManager::new();
        let t1 = TxnId(1);

        let a: LogRecord<String, i32> = log.insert_record(t1, k("a"), 1);
        let b: LogRecord<String, i32> = log.insert_record(t1, k("b"), 2);
        {
            let mut file = LogFile::open(&path).unwrap();
            file.append(&a).unwrap();
            file.append(&b).unwrap();
            file.sync().unwrap();
        }
        // flip a payload byte of the last frame
        {
            let mut bytes = std::fs::read(&path).unwrap();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            std::fs::write(&path, bytes).unwrap();
        }

        let back: Vec<LogRecord<String, i32>> = LogFile::replay(&path).unwrap();
        assert_eq!(back, vec![a]);
    }

    #[test]
    fn truncate_clears_the_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let log = LogManager::new();
        let t1 = TxnId(1);

        let mut file = LogFile::open(&path).unwrap();
        file.append(&log.insert_record(t1, k("a"), 1)).unwrap();
        file.truncate().unwrap();
        file.append(&log.insert_record(t1, k("b"), 2)).unwrap();
        file.sync().unwrap();
        drop(file);

        let back: Vec<LogRecord<String, i32>> = LogFile::replay(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert!(matches!(&back[0].op, LogOp::Insert { key, .. } if key == "b"));
    }
}
