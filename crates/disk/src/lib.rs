//! Page-granular I/O against the single database file.
//!
//! The file is carved into extents: one bitmap page followed by the data
//! pages it tracks. Callers address data pages by logical id; the disk
//! manager owns the logical-to-physical mapping and the allocation state.
//!
//! Page-level I/O failures are fatal. There is no recovery below this
//! interface, so a failed read or write aborts the process.


mod bitmap;

pub use bitmap::BitmapPage;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::{DbResult, PageId, PAGE_SIZE};
use tracing::debug;

/// Number of data pages one bitmap page tracks: every bit of the page body
/// after the 8-byte bitmap header.
pub const EXTENT_CAPACITY: u32 = ((PAGE_SIZE - bitmap::BITMAP_HEADER) * 8) as u32;

/// Upper bound on extents representable in the meta page.
pub const MAX_EXTENTS: usize = (PAGE_SIZE - 8) / 4;

/// Physical page 0: allocation totals plus the per-extent used counters.
///
/// `num_extents` counts extents currently holding pages: it grows when an
/// allocation lands past it and shrinks whenever any extent's usage
/// reaches zero. The `extent_used` array is positional and never shrinks,
/// so an extent emptied in the middle stays addressable and is refilled
/// first by the allocation scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskFileMeta {
    pub num_allocated_pages: u32,
    pub num_extents: u32,
    pub extent_used: Vec<u32>,
}

impl DiskFileMeta {
    pub fn num_extents(&self) -> u32 {
        self.num_extents
    }

    fn write_to(&self, buf: &mut [u8]) {
        assert!(self.extent_used.len() <= MAX_EXTENTS, "extent table overflow");
        buf[..PAGE_SIZE].fill(0);
        buf[0..4].copy_from_slice(&self.num_allocated_pages.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_extents.to_le_bytes());
        for (i, used) in self.extent_used.iter().enumerate() {
            let at = 8 + i * 4;
            buf[at..at + 4].copy_from_slice(&used.to_le_bytes());
        }
    }

    fn read_from(buf: &[u8]) -> Self {
        let num_allocated_pages = u32::from_le_bytes(buf[0..4].try_into().expect("meta header"));
        let num_extents = u32::from_le_bytes(buf[4..8].try_into().expect("meta header"));
        // the counter array fills the page and is zero-padded; trailing
        // zeroes are indistinguishable from absent extents
        let mut extent_used = Vec::new();
        for i in 0..MAX_EXTENTS {
            let at = 8 + i * 4;
            extent_used.push(u32::from_le_bytes(buf[at..at + 4].try_into().expect("meta entry")));
        }
        while extent_used.last() == Some(&0) {
            extent_used.pop();
        }
        Self {
            num_allocated_pages,
            num_extents,
            extent_used,
        }
    }
}

struct DiskInner {
    file: File,
    meta: DiskFileMeta,
    closed: bool,
}

/// Maps logical page ids to offsets in the backing file and hands out pages
/// in O(1) amortised via the extent bitmaps.
pub struct DiskManager {
    path: PathBuf,
    inner: Mutex<DiskInner>,
}

impl DiskManager {
    /// Open `path`, creating the file (and parent directories) when absent,
    /// then load the allocation metadata from physical page 0. A fresh file
    /// reads as all-zero pages, so a new database starts with zero extents.
    pub fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut buf = [0u8; PAGE_SIZE];
        read_physical(&mut &file, 0, &mut buf);
        let meta = DiskFileMeta::read_from(&buf);

        Ok(Self {
            path,
            inner: Mutex::new(DiskInner {
                file,
                meta,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the data page `logical` into `buf`. Pages past the end of the
    /// file read as zeroes.
    pub fn read_page(&self, logical: PageId, buf: &mut [u8]) {
        assert!(logical.is_valid(), "invalid page id {logical}");
        let inner = self.inner.lock().expect("disk latch poisoned");
        read_physical(&mut &inner.file, map_page_id(logical), buf);
    }

    /// Write `buf` as the data page `logical`.
    pub fn write_page(&self, logical: PageId, buf: &[u8]) {
        assert!(logical.is_valid(), "invalid page id {logical}");
        let inner = self.inner.lock().expect("disk latch poisoned");
        write_physical(&mut &inner.file, map_page_id(logical), buf);
    }

    /// Allocate one data page, preferring the lowest free slot of the first
    /// non-full extent, and return its logical id.
    pub fn allocate_page(&self) -> PageId {
        let mut inner = self.inner.lock().expect("disk latch poisoned");

        let extent = match inner
            .meta
            .extent_used
            .iter()
            .position(|&used| used < EXTENT_CAPACITY)
        {
            Some(i) => i,
            None => {
                assert!(inner.meta.extent_used.len() < MAX_EXTENTS, "database file is full");
                inner.meta.extent_used.push(0);
                inner.meta.extent_used.len() - 1
            }
        };

        let mut buf = [0u8; PAGE_SIZE];
        let bitmap_phys = bitmap_physical(extent);
        read_physical(&mut &inner.file, bitmap_phys, &mut buf);
        let mut bitmap = BitmapPage::read_from(&buf);
        let offset = bitmap
            .allocate()
            .expect("extent marked non-full but bitmap is exhausted");
        bitmap.write_to(&mut buf);

        if extent as u32 >= inner.meta.num_extents {
            inner.meta.num_extents += 1;
        }
        inner.meta.extent_used[extent] += 1;
        inner.meta.num_allocated_pages += 1;

        write_physical(&mut &inner.file, bitmap_phys, &buf);
        let mut meta_buf = [0u8; PAGE_SIZE];
        inner.meta.write_to(&mut meta_buf);
        write_physical(&mut &inner.file, 0, &meta_buf);

        let logical = PageId(extent as i32 * EXTENT_CAPACITY as i32 + offset as i32);
        debug!(page = logical.0, extent, "allocated data page");
        logical
    }

    /// Release a data page. A double free is a no-op.
    pub fn deallocate_page(&self, logical: PageId) {
        assert!(logical.is_valid(), "invalid page id {logical}");
        let mut inner = self.inner.lock().expect("disk latch poisoned");

        let extent = (logical.0 as u32 / EXTENT_CAPACITY) as usize;
        let offset = logical.0 as u32 % EXTENT_CAPACITY;
        if extent >= inner.meta.extent_used.len() {
            return;
        }

        let mut buf = [0u8; PAGE_SIZE];
        let bitmap_phys = bitmap_physical(extent);
        read_physical(&mut &inner.file, bitmap_phys, &mut buf);
        let mut bitmap = BitmapPage::read_from(&buf);
        if !bitmap.deallocate(offset) {
            return;
        }
        bitmap.write_to(&mut buf);

        inner.meta.extent_used[extent] -= 1;
        if inner.meta.extent_used[extent] == 0 {
            inner.meta.num_extents = inner.meta.num_extents.saturating_sub(1);
        }
        inner.meta.num_allocated_pages -= 1;

        write_physical(&mut &inner.file, bitmap_phys, &buf);
        let mut meta_buf = [0u8; PAGE_SIZE];
        inner.meta.write_to(&mut meta_buf);
        write_physical(&mut &inner.file, 0, &meta_buf);
        debug!(page = logical.0, extent, "freed data page");
    }

    /// True when the extent bitmap shows `logical` unallocated.
    pub fn is_page_free(&self, logical: PageId) -> bool {
        assert!(logical.is_valid(), "invalid page id {logical}");
        let inner = self.inner.lock().expect("disk latch poisoned");

        let extent = (logical.0 as u32 / EXTENT_CAPACITY) as usize;
        let offset = logical.0 as u32 % EXTENT_CAPACITY;
        if extent >= inner.meta.extent_used.len() {
            return true;
        }
        let mut buf = [0u8; PAGE_SIZE];
        read_physical(&mut &inner.file, bitmap_physical(extent), &mut buf);
        BitmapPage::read_from(&buf).is_free(offset)
    }

    pub fn meta(&self) -> DiskFileMeta {
        self.inner.lock().expect("disk latch poisoned").meta.clone()
    }

    /// Persist the meta page and stop accepting I/O. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("disk latch poisoned");
        if inner.closed {
            return;
        }
        let mut meta_buf = [0u8; PAGE_SIZE];
        inner.meta.write_to(&mut meta_buf);
        write_physical(&mut &inner.file, 0, &meta_buf);
        inner.file.sync_all().expect("disk sync failed");
        inner.closed = true;
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Logical-to-physical translation: physical page 0 is the meta page and
/// every extent is led by its bitmap page.
pub fn map_page_id(logical: PageId) -> u64 {
    2 + logical.0 as u64 + logical.0 as u64 / EXTENT_CAPACITY as u64
}

fn bitmap_physical(extent: usize) -> u64 {
    extent as u64 * (EXTENT_CAPACITY as u64 + 1) + 1
}

fn read_physical(file: &mut &File, physical: u64, buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), PAGE_SIZE);
    let offset = physical * PAGE_SIZE as u64;
    let len = file.metadata().expect("disk stat failed").len();
    if offset >= len {
        buf.fill(0);
        return;
    }
    file.seek(SeekFrom::Start(offset)).expect("disk seek failed");
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => panic!("disk read failed: {e}"),
        }
    }
    buf[read..].fill(0);
}

fn write_physical(file: &mut &File, physical: u64, buf: &[u8]) {
    debug_assert_eq!(buf.len(), PAGE_SIZE);
    let offset = physical * PAGE_SIZE as u64;
    file.seek(SeekFrom::Start(offset)).expect("disk seek failed");
    file.write_all(buf).expect("disk write failed");
}
