//! Page occupancy bitmap for full-database verification.
//!
//! The verifier seeds a bitmap with every page position set, walks the
//! database marking pages it can account for, and asks the free queues to
//! clear the pages they hold. Whatever remains set is leaked; clearing a
//! bit twice means two structures claim the same page.

use coffer_error::{CofferError, Result};
use coffer_types::PageId;
use roaring::RoaringTreemap;

/// A set of page positions with an explicit upper limit.
///
/// Positions at or beyond the limit are silently ignored by [`clear`]
/// (reserve lists may legitimately reference pages past the current end of
/// the file), while double-clears below the limit are corruption.
///
/// [`clear`]: PageBitmap::clear
pub struct PageBitmap {
    bits: RoaringTreemap,
    limit: u64,
}

impl PageBitmap {
    /// Create a bitmap covering `[0, page_count)` with every position set.
    pub fn new(page_count: u64) -> Self {
        let mut bits = RoaringTreemap::new();
        if page_count > 0 {
            bits.insert_range(0..page_count);
        }
        Self {
            bits,
            limit: page_count,
        }
    }

    /// Clear the bit for `id`.
    ///
    /// Ignores positions at or beyond the limit. Clearing a bit that is
    /// already clear signals a doubly freed page.
    pub fn clear(&mut self, id: PageId) -> Result<()> {
        if self.bits.remove(id) || id >= self.limit {
            Ok(())
        } else {
            Err(CofferError::corrupt(format!("doubly freed page {id}")))
        }
    }

    /// Set the bit for `id`, re-marking the position as unaccounted.
    ///
    /// Positions at or beyond the limit are ignored, mirroring [`clear`].
    ///
    /// [`clear`]: PageBitmap::clear
    pub fn set(&mut self, id: PageId) {
        if id < self.limit {
            self.bits.insert(id);
        }
    }

    /// Number of positions still set.
    pub fn cardinality(&self) -> u64 {
        self.bits.len()
    }

    /// Whether the bit for `id` is set.
    pub fn contains(&self, id: PageId) -> bool {
        self.bits.contains(id)
    }

    /// Number of positions the bitmap covers.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_every_position() {
        let bitmap = PageBitmap::new(64);
        assert_eq!(bitmap.cardinality(), 64);
        assert!(bitmap.contains(0));
        assert!(bitmap.contains(63));
        assert!(!bitmap.contains(64));
    }

    #[test]
    fn clear_drops_cardinality() {
        let mut bitmap = PageBitmap::new(16);
        bitmap.clear(5).unwrap();
        bitmap.clear(6).unwrap();
        assert_eq!(bitmap.cardinality(), 14);
        assert!(!bitmap.contains(5));
    }

    #[test]
    fn double_clear_is_corrupt() {
        let mut bitmap = PageBitmap::new(64);
        bitmap.clear(42).unwrap();
        let err = bitmap.clear(42).unwrap_err();
        assert!(err.to_string().contains("doubly freed page 42"));
    }

    #[test]
    fn set_restores_a_cleared_position() {
        let mut bitmap = PageBitmap::new(16);
        bitmap.clear(9).unwrap();
        bitmap.set(9);
        assert!(bitmap.contains(9));
        assert_eq!(bitmap.cardinality(), 16);
        // Clearing it again is legal once it has been re-set.
        bitmap.clear(9).unwrap();
        assert_eq!(bitmap.cardinality(), 15);
    }

    #[test]
    fn set_beyond_limit_is_ignored() {
        let mut bitmap = PageBitmap::new(16);
        bitmap.set(100);
        assert!(!bitmap.contains(100));
        assert_eq!(bitmap.cardinality(), 16);
    }

    #[test]
    fn clear_beyond_limit_is_ignored() {
        let mut bitmap = PageBitmap::new(8);
        bitmap.clear(1000).unwrap();
        bitmap.clear(1000).unwrap();
        assert_eq!(bitmap.cardinality(), 8);
    }

    #[test]
    fn empty_bitmap() {
        let mut bitmap = PageBitmap::new(0);
        assert_eq!(bitmap.cardinality(), 0);
        bitmap.clear(0).unwrap();
    }
}
