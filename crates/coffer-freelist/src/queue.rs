//! The durable free-page queue.
//!
//! A queue is a singly linked chain of [node](crate::node) pages holding
//! delta-compressed page ids. It is split in two: the *remove side* is the
//! prefix that allocations may consume, and the *append side* is the tail
//! that absorbs pages freed during the current checkpoint epoch. The
//! `append_head_id` barrier separates the two. Pages appended in epoch *E*
//! become removable only after the checkpoint for *E* is durable
//! ([`commit_end`](PageQueue::commit_end) advances the barrier), so the old
//! image of the file stays intact until it can no longer be needed. An
//! *aggressive* queue (the reserve list) skips that fence and lets removal
//! run all the way to the append tail.
//!
//! # Locking
//!
//! Two locks guard the queue. The append lock is internal and re-entrant:
//! draining the heap allocates a node through the page manager, and serving
//! that allocation can append to this queue again. The remove lock is a
//! plain mutex whose guard the caller holds across
//! [`try_remove`](PageQueue::try_remove); retiring an exhausted chain node
//! calls back into the page manager, which takes the append lock, so the
//! caller performs that delete only after dropping the remove guard. When
//! both locks are needed, the append lock is always taken first
//! ([`commit_lock`](PageQueue::commit_lock)).

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, warn};

use coffer_error::{CofferError, Result};
use coffer_types::encoding::mix64;
use coffer_types::{PageId, FIRST_FREE_PAGE};

use crate::bitmap::PageBitmap;
use crate::header::QueueHeader;
use crate::id_heap::IdHeap;
use crate::node::{self, NODE_HEADER_SIZE};
use crate::traits::{AllocMode, PageArray, PageManager, Stats};

/// Remove-side state: the consuming cursor over the chain.
///
/// Obtained from [`PageQueue::remove_lock`] and passed back into the
/// remove-side operations, which keeps the lock requirement visible in
/// every signature.
pub struct RemoveState {
    page_count: u64,
    node_count: u64,
    head_id: PageId,
    head_offset: usize,
    head_first_page_id: PageId,
    /// When the cursor stops at the barrier, the barrier node to resume
    /// from once it moves.
    stopped_id: PageId,
    /// Cached image of the current head node.
    head: Vec<u8>,
}

impl RemoveState {
    /// Pages still reachable on the remove side.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Chain nodes still reachable on the remove side, excluding the tail.
    pub fn node_count(&self) -> u64 {
        self.node_count
    }
}

/// Append-side state, guarded by the re-entrant append lock.
struct AppendState {
    heap: IdHeap,
    /// Staging buffer for the node being filled.
    tail: Vec<u8>,
    page_count: u64,
    node_count: u64,
    drain_in_progress: bool,
}

/// Result of a successful [`PageQueue::try_remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a retired node must be deleted after the remove lock is dropped"]
pub struct RemovedPage {
    /// The page id removed from the queue.
    pub page_id: PageId,
    /// A chain node that was fully consumed by this removal. The caller
    /// must drop the remove guard and then pass this id to
    /// `PageManager::delete_page` with `recycle = false`; deleting it
    /// funnels the node through the normal free list so its image survives
    /// until the next commit.
    pub retired_node: Option<PageId>,
}

/// Both queue locks, append acquired before remove.
pub struct CommitLock<'a> {
    append: ReentrantMutexGuard<'a, RefCell<AppendState>>,
    remove: MutexGuard<'a, RemoveState>,
}

/// A persistent FIFO of free page ids with a checkpointed barrier.
pub struct PageQueue<M: PageManager> {
    manager: Arc<M>,
    alloc_mode: AllocMode,
    aggressive: bool,
    /// Barrier between the remove and append sides. Written under the
    /// remove lock at commit end, read from both sides.
    append_head_id: AtomicU64,
    /// Id of the (still unwritten) tail node. Written under the append
    /// lock, read by aggressive removal under the remove lock.
    append_tail_id: AtomicU64,
    append: ReentrantMutex<RefCell<AppendState>>,
    remove: Mutex<RemoveState>,
}

impl<M: PageManager> PageQueue<M> {
    /// Create a fresh queue whose single empty node `head_node_id` is
    /// simultaneously the remove stop point, the barrier, and the append
    /// tail.
    pub fn create(manager: Arc<M>, alloc_mode: AllocMode, aggressive: bool, head_node_id: PageId) -> Self {
        let page_size = manager.page_array().page_size().as_usize();
        Self {
            manager,
            alloc_mode,
            aggressive,
            append_head_id: AtomicU64::new(head_node_id),
            append_tail_id: AtomicU64::new(head_node_id),
            append: ReentrantMutex::new(RefCell::new(AppendState {
                heap: IdHeap::new(page_size - NODE_HEADER_SIZE),
                tail: vec![0; page_size],
                page_count: 0,
                node_count: 0,
                drain_in_progress: false,
            })),
            remove: Mutex::new(RemoveState {
                page_count: 0,
                node_count: 0,
                head_id: 0,
                head_offset: 0,
                head_first_page_id: 0,
                stopped_id: head_node_id,
                head: vec![0; page_size],
            }),
        }
    }

    /// Restore a queue from a header slice written by
    /// [`commit_start`](Self::commit_start), reloading the cached head
    /// node.
    pub fn restore(
        manager: Arc<M>,
        alloc_mode: AllocMode,
        aggressive: bool,
        header: &[u8],
        offset: usize,
    ) -> Result<Self> {
        let decoded = QueueHeader::read_from(header, offset);
        let queue = Self::create(manager, alloc_mode, aggressive, decoded.append_head_id);
        {
            let mut remove = queue.remove.lock();
            remove.page_count = decoded.remove_page_count;
            remove.node_count = decoded.remove_node_count;
            remove.head_id = decoded.remove_head_id;
            remove.head_offset = decoded.remove_head_offset as usize;
            remove.head_first_page_id = decoded.remove_head_first_page_id;

            if remove.head_id == 0 {
                remove.stopped_id = decoded.append_head_id;
            } else {
                remove.stopped_id = 0;
                let head_id = remove.head_id;
                queue.manager.page_array().read_page(head_id, &mut remove.head)?;
                if remove.head_first_page_id == 0 {
                    remove.head_first_page_id = node::first_page_id(&remove.head);
                }
            }
        }
        Ok(queue)
    }

    /// Acquire the remove lock.
    pub fn remove_lock(&self) -> MutexGuard<'_, RemoveState> {
        self.remove.lock()
    }

    /// Acquire both locks in the append-then-remove order required by the
    /// commit protocol.
    pub fn commit_lock(&self) -> CommitLock<'_> {
        let append = self.append.lock();
        let remove = self.remove.lock();
        CommitLock { append, remove }
    }

    /// Append a freed page.
    ///
    /// Once the heap is full enough that one more id might not fit in a
    /// node payload, the heap is drained inline into the tail node.
    ///
    /// # Panics
    ///
    /// Panics if `page_id` is 0 or 1; those ids never circulate through a
    /// free list.
    pub fn append(&self, page_id: PageId) -> Result<()> {
        assert!(
            page_id >= FIRST_FREE_PAGE,
            "page id {page_id} is reserved and cannot be freed"
        );

        let append = self.append.lock();
        {
            let mut state = append.borrow_mut();
            state.heap.push(page_id);
            state.page_count += 1;
            if state.drain_in_progress || !state.heap.should_drain() {
                // A drain in progress means this append came from the
                // allocation inside that drain; the heap's headroom slot
                // absorbs it and it is flushed by a later drain.
                return Ok(());
            }
        }
        self.drain_append_heap(&append)
    }

    /// Take back the smallest id still sitting in the append heap.
    ///
    /// Returns `None` when the heap is empty, and refuses to hand out the
    /// last id while a drain is in progress (the drain owns it). Must not
    /// be called while holding the remove lock.
    pub fn try_unappend(&self) -> Option<PageId> {
        let append = self.append.lock();
        let mut state = append.borrow_mut();
        if state.drain_in_progress && state.heap.len() <= 1 {
            return None;
        }
        let id = state.heap.pop_min()?;
        state.page_count -= 1;
        Some(id)
    }

    /// Remove a page to satisfy an allocation request.
    ///
    /// Returns `None` when the remove side is exhausted: for a normal queue
    /// once the cursor reaches the barrier, for an aggressive queue once it
    /// reaches the very tail. On success the caller takes the page id; if
    /// [`RemovedPage::retired_node`] is set, the caller must drop the
    /// remove guard first and then delete that node through the page
    /// manager (deleting under the remove lock would invert the global lock
    /// order against commit).
    pub fn try_remove(&self, remove: &mut RemoveState) -> Result<Option<RemovedPage>> {
        if remove.head_id == 0 {
            if !self.aggressive
                || remove.stopped_id == self.append_tail_id.load(Ordering::Acquire)
            {
                return Ok(None);
            }
            // A newer append tail exists, so aggressive removal resumes
            // past the old stop point.
            let stopped_id = remove.stopped_id;
            self.load_remove_node(remove, stopped_id)?;
            remove.stopped_id = 0;
        }

        let page_id = remove.head_first_page_id;

        if self.manager.is_page_out_of_bounds(page_id) {
            if self.alloc_mode != AllocMode::Reserve {
                return Err(CofferError::corrupt(format!(
                    "invalid page id in free list: {page_id}"
                )));
            }
            // Reserve chains may reference pages beyond the current end of
            // the file; the id is trusted as-is.
            warn!(page_id, "out-of-bounds page id in reserve free list");
        }

        remove.page_count -= 1;

        if remove.head_offset < remove.head.len() {
            let delta = node::read_delta(&remove.head, &mut remove.head_offset)?;
            if delta > 0 {
                remove.head_first_page_id = page_id.wrapping_add(delta);
                return Ok(Some(RemovedPage {
                    page_id,
                    retired_node: None,
                }));
            }
            // A zero delta terminates the payload.
        }

        // The head node is exhausted; step past it. The node itself is
        // retired by the caller, outside the remove lock.
        let retired = remove.head_id;
        let next_id = node::next_node_id(&remove.head);
        let barrier = if self.aggressive {
            self.append_tail_id.load(Ordering::Acquire)
        } else {
            self.append_head_id.load(Ordering::Acquire)
        };

        if next_id == barrier {
            remove.head_id = 0;
            remove.head_offset = 0;
            remove.head_first_page_id = 0;
            remove.stopped_id = next_id;
        } else {
            self.load_remove_node(remove, next_id)?;
        }
        remove.node_count -= 1;

        Ok(Some(RemovedPage {
            page_id,
            retired_node: Some(retired),
        }))
    }

    /// Load `id` as the new head node. Caller must hold the remove lock.
    fn load_remove_node(&self, remove: &mut RemoveState, id: PageId) -> Result<()> {
        if self.manager.is_page_out_of_bounds(id) {
            return Err(CofferError::corrupt(format!(
                "invalid node id in free list: {id}"
            )));
        }
        self.manager.page_array().read_page(id, &mut remove.head)?;
        remove.head_id = id;
        remove.head_offset = NODE_HEADER_SIZE;
        remove.head_first_page_id = node::first_page_id(&remove.head);
        Ok(())
    }

    /// Drain the heap into the current tail node and link a fresh tail.
    fn drain_append_heap(&self, append: &RefCell<AppendState>) -> Result<()> {
        {
            let mut state = append.borrow_mut();
            assert!(!state.drain_in_progress, "append heap drain re-entered");
            state.drain_in_progress = true;
        }
        let result = self.write_tail_node(append);
        append.borrow_mut().drain_in_progress = false;
        result
    }

    fn write_tail_node(&self, append: &RefCell<AppendState>) -> Result<()> {
        // No borrow may be held across this allocation: serving it can
        // re-enter `append` on a reserve queue.
        let new_tail_id = self.manager.alloc_page(self.alloc_mode)?;

        let mut state = append.borrow_mut();
        let state = &mut *state;
        let Some(first_page_id) = state.heap.pop_min() else {
            return Ok(());
        };

        node::write_header(&mut state.tail, new_tail_id, first_page_id);
        let end = NODE_HEADER_SIZE
            + state
                .heap
                .drain(first_page_id, &mut state.tail[NODE_HEADER_SIZE..]);
        // Clear residue from earlier drains; a zero byte terminates the
        // delta scan.
        state.tail[end..].fill(0);

        let old_tail_id = self.append_tail_id.load(Ordering::Acquire);
        self.manager.page_array().write_page(old_tail_id, &state.tail)?;

        state.node_count += 1;
        self.append_tail_id.store(new_tail_id, Ordering::Release);

        debug!(
            node = old_tail_id,
            next = new_tail_id,
            payload_bytes = end - NODE_HEADER_SIZE,
            "drained append heap into queue node"
        );
        Ok(())
    }

    /// Flush every appended id onto the on-disk chain.
    pub fn pre_commit(&self, lock: &CommitLock<'_>) -> Result<()> {
        while !lock.append.borrow().heap.is_empty() {
            self.drain_append_heap(&lock.append)?;
        }
        Ok(())
    }

    /// Write the post-epoch queue state into the checkpoint header.
    ///
    /// The caller must have called [`pre_commit`](Self::pre_commit) under
    /// the same lock. Append counts fold into the remove side now, but the
    /// pages themselves stay fenced until [`commit_end`](Self::commit_end).
    pub fn commit_start(&self, lock: &mut CommitLock<'_>, header: &mut [u8], offset: usize) {
        let mut append_state = lock.append.borrow_mut();
        let append_state = &mut *append_state;
        let remove = &mut *lock.remove;

        let append_tail_id = self.append_tail_id.load(Ordering::Acquire);

        let mut encoded = QueueHeader {
            remove_page_count: remove.page_count + append_state.page_count,
            remove_node_count: remove.node_count + append_state.node_count,
            remove_head_id: remove.head_id,
            remove_head_offset: remove.head_offset as u32,
            remove_head_first_page_id: remove.head_first_page_id,
            // Once this checkpoint is durable, everything before the
            // current tail is removable.
            append_head_id: append_tail_id,
        };

        if remove.head_id == 0 && append_state.page_count > 0 {
            // The remove side restarts at the old barrier node. The seed is
            // written as zero; restore reads it from the node image.
            encoded.remove_head_id = self.append_head_id.load(Ordering::Acquire);
            encoded.remove_head_offset = NODE_HEADER_SIZE as u32;
            encoded.remove_head_first_page_id = 0;
        }

        encoded.write_to(header, offset);

        remove.page_count += append_state.page_count;
        remove.node_count += append_state.node_count;
        append_state.page_count = 0;
        append_state.node_count = 0;

        debug!(
            remove_pages = remove.page_count,
            remove_nodes = remove.node_count,
            barrier = encoded.append_head_id,
            "queue commit started"
        );
    }

    /// Apply the durable header: advance the barrier and, if the remove
    /// side was exhausted, resume it at the old stop point.
    pub fn commit_end(&self, remove: &mut RemoveState, header: &[u8], offset: usize) -> Result<()> {
        let new_append_head_id = QueueHeader::read_append_head_id(header, offset);

        if remove.head_id == 0 && remove.stopped_id != new_append_head_id {
            let stopped_id = remove.stopped_id;
            self.load_remove_node(remove, stopped_id)?;
            remove.stopped_id = 0;
        }

        self.append_head_id.store(new_append_head_id, Ordering::Release);
        debug!(barrier = new_append_head_id, "queue commit finished");
        Ok(())
    }

    /// Drain and delete every page this queue still holds, recycling ids
    /// up to `upper_bound` (inclusive) and discarding the rest.
    ///
    /// Used to dispose of a reserve list when the file shrinks.
    ///
    /// # Panics
    ///
    /// Panics unless this is an aggressive reserve queue; no other queue
    /// may hand its pages straight back.
    pub fn reclaim(&self, upper_bound: PageId, recycle: bool) -> Result<()> {
        assert!(
            self.alloc_mode == AllocMode::Reserve && self.aggressive,
            "reclaim is only valid on an aggressive reserve queue"
        );

        while let Some(page_id) = self.try_unappend() {
            if page_id <= upper_bound {
                self.manager.delete_page(page_id, recycle)?;
            }
        }

        loop {
            let mut remove = self.remove.lock();
            let Some(removed) = self.try_remove(&mut remove)? else {
                break;
            };
            drop(remove);
            if removed.page_id <= upper_bound {
                self.manager.delete_page(removed.page_id, recycle)?;
            }
            if let Some(node_id) = removed.retired_node {
                self.manager.delete_page(node_id, false)?;
            }
        }

        let stopped_id = self.remove.lock().stopped_id;
        if stopped_id != 0 && stopped_id <= upper_bound {
            // Finish off the empty tail node. Node images cannot be
            // recycled until after a commit.
            self.manager.delete_page(stopped_id, false)?;
        }

        debug!(upper_bound, recycle, "reserve queue reclaimed");
        Ok(())
    }

    /// Check that the pages reachable on the remove side are exactly the
    /// closed-open range `[start_id, end_id)`, assuming no duplicates.
    ///
    /// Chain node ids that fall inside the range are counted as members
    /// too. The comparison uses a commutative hash of [`mix64`] values, so
    /// observation order does not matter.
    pub fn verify_page_range(
        &self,
        remove: &RemoveState,
        start_id: PageId,
        end_id: PageId,
    ) -> Result<bool> {
        let mut expected_hash: u64 = 0;
        for id in start_id..end_id {
            expected_hash = expected_hash.wrapping_add(mix64(id));
        }

        let mut hash: u64 = 0;
        let mut count: u64 = 0;

        let mut node_id = remove.head_id;
        if node_id != 0 {
            let mut node_buf = remove.head.clone();
            let mut page_id = remove.head_first_page_id;
            let mut offset = remove.head_offset;
            let append_tail_id = self.append_tail_id.load(Ordering::Acquire);

            loop {
                if page_id < start_id || page_id >= end_id {
                    return Ok(false);
                }
                hash = hash.wrapping_add(mix64(page_id));
                count += 1;

                if offset < node_buf.len() {
                    let delta = node::read_delta(&node_buf, &mut offset)?;
                    if delta > 0 {
                        page_id = page_id.wrapping_add(delta);
                        continue;
                    }
                }

                if node_id >= start_id && node_id < end_id {
                    hash = hash.wrapping_add(mix64(node_id));
                    count += 1;
                }

                node_id = node::next_node_id(&node_buf);
                if node_id == append_tail_id {
                    break;
                }
                self.manager.page_array().read_page(node_id, &mut node_buf)?;
                page_id = node::first_page_id(&node_buf);
                offset = NODE_HEADER_SIZE;
            }
        }

        Ok(hash == expected_hash && count == end_id - start_id)
    }

    /// Clear the bit of every page and chain node reachable as free,
    /// including the barrier node. Returns how many positions were visited.
    ///
    /// A bit that is already clear signals a doubly freed page. Caller must
    /// hold the remove lock.
    pub fn trace_removable_pages(
        &self,
        remove: &RemoveState,
        pages: &mut PageBitmap,
    ) -> Result<u64> {
        let mut count: u64 = 0;

        // The barrier node is not removable, but it belongs to the queue;
        // leaving its bit set would report a phantom leak after startup.
        let append_head_id = self.append_head_id.load(Ordering::Acquire);
        if append_head_id < self.manager.page_array().page_count() {
            count += 1;
            pages.clear(append_head_id)?;
        }

        let mut node_id = remove.head_id;
        if node_id == 0 {
            return Ok(count);
        }

        let append_tail_id = self.append_tail_id.load(Ordering::Acquire);
        let mut node_buf = remove.head.clone();
        let mut page_id = remove.head_first_page_id;
        let mut offset = remove.head_offset;

        loop {
            count += 1;
            pages.clear(page_id)?;

            if offset < node_buf.len() {
                let delta = node::read_delta(&node_buf, &mut offset)?;
                if delta > 0 {
                    page_id = page_id.wrapping_add(delta);
                    continue;
                }
            }

            // The chain node itself is free once its payload is consumed.
            count += 1;
            pages.clear(node_id)?;

            node_id = node::next_node_id(&node_buf);
            if node_id == append_head_id || node_id == append_tail_id {
                break;
            }
            self.manager.page_array().read_page(node_id, &mut node_buf)?;
            page_id = node::first_page_id(&node_buf);
            offset = NODE_HEADER_SIZE;
        }

        Ok(count)
    }

    /// Fold this queue's page and node counts into the engine stats.
    pub fn add_to(&self, stats: &mut Stats) {
        let append = self.append.lock();
        let remove = self.remove.lock();
        let state = append.borrow();
        stats.free_pages +=
            remove.page_count + state.page_count + remove.node_count + state.node_count;
    }
}
