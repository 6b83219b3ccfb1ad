//! Collaborator interfaces between the free-page queue and the page manager.
//!
//! The queue allocates and deletes its own chain nodes through the manager
//! that owns it, and reads and writes node images through the manager's page
//! array. Both traits are open: the engine implements them on its page
//! manager, and tests implement them on in-memory mocks.

use coffer_error::Result;
use coffer_types::{PageId, PageSize};

/// Which pool a page allocation should be served from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Allocate from the normal free list, growing the file if needed.
    #[default]
    Normal,
    /// Allocate from the reserve list. Used while the file is being
    /// compacted and identifiers above the compaction target must not be
    /// handed out.
    Reserve,
}

/// Fixed-size page storage backing the database file.
///
/// Reads and writes are synchronous; buffers are exactly one page long.
pub trait PageArray: Send + Sync {
    /// Size of every page in the array.
    fn page_size(&self) -> PageSize;

    /// Total number of pages currently addressable.
    fn page_count(&self) -> u64;

    /// Read the page `id` into `buf`. `buf.len()` must equal the page size.
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` as the new image of page `id`.
    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()>;
}

/// The page manager that owns the free lists.
///
/// The queue calls back into the manager to allocate fresh chain nodes and
/// to retire consumed ones. Implementations must tolerate being re-entered
/// from [`alloc_page`](Self::alloc_page): draining a reserve queue allocates
/// a node, and serving that allocation may append to the same queue again.
pub trait PageManager: Send + Sync {
    /// The page array this manager operates on.
    type Array: PageArray;

    /// Access the backing page array.
    fn page_array(&self) -> &Self::Array;

    /// Allocate a page, served from the pool selected by `mode`.
    fn alloc_page(&self, mode: AllocMode) -> Result<PageId>;

    /// Delete a page. With `recycle` set, the identifier may be handed out
    /// again before the next commit; without it, the page funnels through
    /// the normal free list and stays untouched until the commit completes.
    fn delete_page(&self, id: PageId, recycle: bool) -> Result<()>;

    /// Whether `id` falls outside the addressable range of the file. Used
    /// for corruption checks while walking the free list.
    fn is_page_out_of_bounds(&self, id: PageId) -> bool;
}

/// Aggregate page accounting reported to the engine's stats surface.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct Stats {
    /// Pages reusable by future allocations, including the free-list chain
    /// nodes themselves.
    pub free_pages: u64,
}
