//! Queue state slice inside the checkpoint header.
//!
//! The page manager reserves 44 bytes per queue in the superblock it writes
//! at each checkpoint. All fields are little-endian, at fixed offsets:
//!
//! ```text
//! Offset  Size  Description
//!   0       8   Remove page count
//!   8       8   Remove node count
//!  16       8   Remove head id (0 when the remove side is exhausted)
//!  24       4   Remove head offset (payload cursor into the head node)
//!  28       8   Remove head first page id (0: read it from the node)
//!  36       8   Append head id (the barrier after the checkpoint)
//! ```

use coffer_types::encoding::{read_u32_le, read_u64_le, write_u32_le, write_u64_le};
use coffer_types::PageId;

const I_REMOVE_PAGE_COUNT: usize = 0;
const I_REMOVE_NODE_COUNT: usize = I_REMOVE_PAGE_COUNT + 8;
const I_REMOVE_HEAD_ID: usize = I_REMOVE_NODE_COUNT + 8;
const I_REMOVE_HEAD_OFFSET: usize = I_REMOVE_HEAD_ID + 8;
const I_REMOVE_HEAD_FIRST_PAGE_ID: usize = I_REMOVE_HEAD_OFFSET + 4;
const I_APPEND_HEAD_ID: usize = I_REMOVE_HEAD_FIRST_PAGE_ID + 8;

/// Encoded size of one queue's header slice.
pub const QUEUE_HEADER_SIZE: usize = I_APPEND_HEAD_ID + 8;

/// Decoded form of the header slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueHeader {
    pub remove_page_count: u64,
    pub remove_node_count: u64,
    pub remove_head_id: PageId,
    pub remove_head_offset: u32,
    /// Seed for the head node's delta scan. Zero means the restore path
    /// must take it from the node image itself.
    pub remove_head_first_page_id: PageId,
    pub append_head_id: PageId,
}

impl QueueHeader {
    /// Decode the slice at `offset`.
    pub fn read_from(header: &[u8], offset: usize) -> Self {
        Self {
            remove_page_count: read_u64_le(header, offset + I_REMOVE_PAGE_COUNT),
            remove_node_count: read_u64_le(header, offset + I_REMOVE_NODE_COUNT),
            remove_head_id: read_u64_le(header, offset + I_REMOVE_HEAD_ID),
            remove_head_offset: read_u32_le(header, offset + I_REMOVE_HEAD_OFFSET),
            remove_head_first_page_id: read_u64_le(header, offset + I_REMOVE_HEAD_FIRST_PAGE_ID),
            append_head_id: read_u64_le(header, offset + I_APPEND_HEAD_ID),
        }
    }

    /// Encode this state into the slice at `offset`.
    pub fn write_to(&self, header: &mut [u8], offset: usize) {
        write_u64_le(header, offset + I_REMOVE_PAGE_COUNT, self.remove_page_count);
        write_u64_le(header, offset + I_REMOVE_NODE_COUNT, self.remove_node_count);
        write_u64_le(header, offset + I_REMOVE_HEAD_ID, self.remove_head_id);
        write_u32_le(header, offset + I_REMOVE_HEAD_OFFSET, self.remove_head_offset);
        write_u64_le(
            header,
            offset + I_REMOVE_HEAD_FIRST_PAGE_ID,
            self.remove_head_first_page_id,
        );
        write_u64_le(header, offset + I_APPEND_HEAD_ID, self.append_head_id);
    }

    /// Read back only the barrier id. Used after the checkpoint becomes
    /// durable, when the rest of the slice has already been applied.
    pub fn read_append_head_id(header: &[u8], offset: usize) -> PageId {
        read_u64_le(header, offset + I_APPEND_HEAD_ID)
    }

    /// Whether a valid queue is encoded at `offset`. Headers from before the
    /// queue's first checkpoint carry a zero remove head id.
    pub fn exists(header: &[u8], offset: usize) -> bool {
        read_u64_le(header, offset + I_REMOVE_HEAD_ID) != 0
    }
}
