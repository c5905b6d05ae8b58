use super::*;
use pretty_assertions::assert_eq;

#[test]
fn row_id_packs_and_unpacks() {
    let rid = RowId::new(PageId(7), 42);
    assert_eq!(RowId::from_u64(rid.to_u64()), rid);

    let max = RowId::new(PageId(i32::MAX), u32::MAX);
    assert_eq!(RowId::from_u64(max.to_u64()), max);
}

#[test]
fn invalid_sentinels() {
    assert!(!PageId::INVALID.is_valid());
    assert!(!RowId::INVALID.is_valid());
    assert!(!Lsn::INVALID.is_valid());
    assert!(PageId(0).is_valid());
    assert!(Lsn(0).is_valid());
}

#[test]
fn reserved_page_ids_are_distinct() {
    assert_ne!(CATALOG_META_PAGE_ID, INDEX_ROOTS_PAGE_ID);
    assert!(CATALOG_META_PAGE_ID.is_valid());
    assert!(INDEX_ROOTS_PAGE_ID.is_valid());
}

#[test]
fn config_defaults_match_builder() {
    let built = Config::builder().build();
    let default = Config::default();
    assert_eq!(built.db_file, default.db_file);
    assert_eq!(built.buffer_pool_pages, default.buffer_pool_pages);
    assert_eq!(built.deadlock_interval_ms, default.deadlock_interval_ms);
    assert_eq!(built.log_enabled, default.log_enabled);
}

#[test]
fn abort_errors_render_reason() {
    let err = DbError::TxnAbort {
        txn_id: TxnId(3),
        reason: AbortReason::Deadlock,
    };
    assert_eq!(format!("{err}"), "transaction 3 aborted: deadlock victim");
}
