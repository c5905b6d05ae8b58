//! The storage engine facade: wires the disk manager, buffer pool, lock
//! manager, transaction manager and catalog over one database file.

pub use btree::{BPlusTree, KeyCodec, TreeIterator};
pub use catalog::{CatalogManager, IndexInfo, TableInfo};
pub use common::prelude::*;
pub use record::{Column, Row, Schema};
pub use recovery::{CheckPoint, LogFile, LogManager, LogOp, LogRecord, RecoveryManager};
pub use storage::{TableHeap, TableIterator};
pub use txn::{IsolationLevel, Txn, TxnManager, TxnState};
pub use types::{TypeId, Value};

use std::sync::Arc;
use std::time::Duration;

use btree::IndexRootsPage;
use buffer::BufferPool;
use common::{Config, DbResult, CATALOG_META_PAGE_ID, INDEX_ROOTS_PAGE_ID};
use disk::DiskManager;
use tracing::info;
use txn::{DeadlockDetector, LockManager};

/// One open database.
///
/// On a fresh file the two reserved logical pages are allocated and
/// formatted; on an existing file the catalog is reloaded from them.
/// Closing flushes every cached page and the disk allocation metadata.
pub struct StorageEngine {
    bp: Arc<BufferPool>,
    lock_mgr: Arc<LockManager>,
    txn_mgr: Arc<TxnManager>,
    catalog: Arc<CatalogManager>,
    detector: Option<DeadlockDetector>,
}

impl StorageEngine {
    pub fn open(config: &Config) -> DbResult<StorageEngine> {
        let disk = Arc::new(DiskManager::new(&config.db_file)?);
        let init = disk.meta().num_allocated_pages == 0;
        let bp = Arc::new(BufferPool::new(config.buffer_pool_pages, disk));

        if init {
            let catalog_meta = bp.new_page().expect("fresh pool has free frames");
            assert_eq!(
                catalog_meta.page_id(),
                CATALOG_META_PAGE_ID,
                "catalog meta page must be the first allocation"
            );
            catalog_meta.mark_dirty();
            let roots = bp.new_page().expect("fresh pool has free frames");
            assert_eq!(
                roots.page_id(),
                INDEX_ROOTS_PAGE_ID,
                "index roots page must be the second allocation"
            );
            IndexRootsPage::format(roots.write().data_mut());
        }

        let lock_mgr = Arc::new(LockManager::new());
        let txn_mgr = Arc::new(TxnManager::new(lock_mgr.clone()));
        let catalog = Arc::new(CatalogManager::new(
            bp.clone(),
            Some(lock_mgr.clone()),
            init,
        )?);
        let detector = lock_mgr.spawn_detector(
            txn_mgr.clone(),
            Duration::from_millis(config.deadlock_interval_ms),
        );

        info!(
            db = %config.db_file.display(),
            fresh = init,
            "storage engine open"
        );
        Ok(StorageEngine {
            bp,
            lock_mgr,
            txn_mgr,
            catalog,
            detector: Some(detector),
        })
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.bp
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.txn_mgr
    }

    pub fn catalog(&self) -> &Arc<CatalogManager> {
        &self.catalog
    }

    /// Flush all cached pages and the disk metadata, then stop background
    /// work. The engine stays usable for reads afterwards, but `close` is
    /// meant as the last call before drop.
    pub fn close(&mut self) {
        if let Some(detector) = self.detector.take() {
            detector.stop();
        }
        self.bp.flush_all_pages();
        self.bp.disk().close();
        info!("storage engine closed");
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.close();
    }
}
