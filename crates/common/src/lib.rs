#[cfg(test)]
mod tests;

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed page size in bytes. Every on-disk structure is laid out inside one
/// of these.
pub const PAGE_SIZE: usize = 4096;

/// Logical id of the page holding the serialized catalog metadata.
pub const CATALOG_META_PAGE_ID: PageId = PageId(0);

/// Logical id of the page mapping index ids to their tree roots.
pub const INDEX_ROOTS_PAGE_ID: PageId = PageId(1);

/// Logical identifier of a data page inside the database file. Negative ids
/// are invalid; `PageId::INVALID` is the shared sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub i32);

impl PageId {
    pub const INVALID: PageId = PageId(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a frame inside the buffer pool. Never persisted.
pub type FrameId = usize;

/// Fully-qualified identifier of a tuple: owning page plus slot number.
/// Slots may be reused after a delete, so a RowId is only unique while the
/// tuple is live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub page_id: PageId,
    pub slot: u32,
}

impl RowId {
    pub const INVALID: RowId = RowId {
        page_id: PageId::INVALID,
        slot: 0,
    };

    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }

    pub fn is_valid(self) -> bool {
        self.page_id.is_valid()
    }

    /// Pack into the 64-bit wire form: page id in the upper half, slot in
    /// the lower.
    pub fn to_u64(self) -> u64 {
        ((self.page_id.0 as u32 as u64) << 32) | self.slot as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            page_id: PageId((raw >> 32) as u32 as i32),
            slot: raw as u32,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// Identifier for a table registered in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u32);

/// Identifier for an index registered in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u32);

/// Transaction identifier, assigned monotonically by the txn manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u32);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log sequence number. Strictly increasing across the process lifetime;
/// `Lsn::INVALID` marks "no predecessor".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lsn(pub i64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// Why the lock manager aborted a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    Deadlock,
    LockOnShrinking,
    SharedOnReadUncommitted,
    UpgradeConflict,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::Deadlock => "deadlock victim",
            AbortReason::LockOnShrinking => "lock acquired while shrinking",
            AbortReason::SharedOnReadUncommitted => "shared lock under read-uncommitted",
            AbortReason::UpgradeConflict => "conflicting lock upgrade",
        };
        write!(f, "{text}")
    }
}

/// Canonical error type shared across the storage subsystems. Routine
/// predicates surface one of these; invariant violations panic instead.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("internal failure: {0}")]
    Failed(String),
    #[error("table '{0}' already exists")]
    TableAlreadyExist(String),
    #[error("table '{0}' does not exist")]
    TableNotExist(String),
    #[error("index '{0}' already exists")]
    IndexAlreadyExist(String),
    #[error("index '{0}' not found")]
    IndexNotFound(String),
    #[error("column '{0}' does not exist")]
    ColumnNameNotExist(String),
    #[error("key not found")]
    KeyNotFound,
    #[error("transaction {txn_id} aborted: {reason}")]
    TxnAbort { txn_id: TxnId, reason: AbortReason },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for the storage engine.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .db_file(PathBuf::from("./data/main.db"))
///     .buffer_pool_pages(64)
///     .build();
/// assert!(config.log_enabled);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Path of the single backing database file.
    #[builder(default = PathBuf::from("./data/main.db"))]
    pub db_file: PathBuf,
    /// Number of pages the buffer pool keeps resident.
    #[builder(default = 256)]
    pub buffer_pool_pages: usize,
    /// Period of the background deadlock-detection sweep, in milliseconds.
    #[builder(default = 50)]
    pub deadlock_interval_ms: u64,
    /// Controls whether mutations append to the on-disk log file.
    #[builder(default = true)]
    pub log_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_file: PathBuf::from("./data/main.db"),
            buffer_pool_pages: 256,
            deadlock_interval_ms: 50,
            log_enabled: true,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        AbortReason, Config, DbError, DbResult, FrameId, IndexId, Lsn, PageId, RowId, TableId,
        TxnId, PAGE_SIZE,
    };
}
