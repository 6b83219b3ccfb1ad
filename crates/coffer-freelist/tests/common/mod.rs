//! Shared in-memory page manager for queue integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use coffer_error::Result;
use coffer_freelist::{AllocMode, PageArray, PageManager, PageQueue};
use coffer_types::{PageId, PageSize};

pub struct MockArray {
    page_size: PageSize,
    page_count: AtomicU64,
    pages: Mutex<HashMap<PageId, Vec<u8>>>,
}

impl PageArray for MockArray {
    fn page_size(&self) -> PageSize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::Relaxed)
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        match self.pages.lock().get(&id) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        self.pages.lock().insert(id, buf.to_vec());
        Ok(())
    }
}

/// Page manager that allocates from a counter and records deletions.
pub struct MockManager {
    array: MockArray,
    next_page_id: AtomicU64,
    deleted: Mutex<Vec<(PageId, bool)>>,
}

impl MockManager {
    pub fn new(page_size: u32, next_page_id: PageId) -> Arc<Self> {
        Arc::new(Self {
            array: MockArray {
                page_size: PageSize::new(page_size).unwrap(),
                page_count: AtomicU64::new(1 << 20),
                pages: Mutex::new(HashMap::new()),
            },
            next_page_id: AtomicU64::new(next_page_id),
            deleted: Mutex::new(Vec::new()),
        })
    }

    pub fn deleted(&self) -> Vec<(PageId, bool)> {
        self.deleted.lock().clone()
    }
}

impl PageManager for MockManager {
    type Array = MockArray;

    fn page_array(&self) -> &MockArray {
        &self.array
    }

    fn alloc_page(&self, _mode: AllocMode) -> Result<PageId> {
        Ok(self.next_page_id.fetch_add(1, Ordering::Relaxed))
    }

    fn delete_page(&self, id: PageId, recycle: bool) -> Result<()> {
        self.deleted.lock().push((id, recycle));
        Ok(())
    }

    fn is_page_out_of_bounds(&self, id: PageId) -> bool {
        id < 2 || id >= self.array.page_count()
    }
}

/// Run a full checkpoint: drain, write the header slice, apply it.
pub fn commit_cycle<M: PageManager>(queue: &PageQueue<M>) -> Vec<u8> {
    let mut header = vec![0u8; coffer_freelist::QUEUE_HEADER_SIZE];
    {
        let mut lock = queue.commit_lock();
        queue.pre_commit(&lock).unwrap();
        queue.commit_start(&mut lock, &mut header, 0);
    }
    let mut remove = queue.remove_lock();
    queue.commit_end(&mut remove, &header, 0).unwrap();
    header
}

/// Drain the remove side, retiring consumed chain nodes the way the page
/// manager would: only after the remove guard is dropped.
pub fn remove_all<M: PageManager>(queue: &PageQueue<M>, manager: &M) -> Vec<PageId> {
    let mut out = Vec::new();
    loop {
        let mut remove = queue.remove_lock();
        match queue.try_remove(&mut remove).unwrap() {
            None => break,
            Some(removed) => {
                drop(remove);
                out.push(removed.page_id);
                if let Some(node_id) = removed.retired_node {
                    manager.delete_page(node_id, false).unwrap();
                }
            }
        }
    }
    out
}
