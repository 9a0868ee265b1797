//! Detached, fail-fast iteration.
//!
//! A [`SlotCursor`] does not borrow its map, so the map may be mutated
//! between steps. Every step compares the map identity and mutation counter
//! captured at creation with the live ones and fails once they differ.
//!
//! ```rust
//! use paged_slotmap::{PagedSlotMap, SlotError};
//!
//! let mut map: PagedSlotMap<u32> = PagedSlotMap::new();
//! map.add(1);
//! map.add(2);
//!
//! let mut cursor = map.cursor();
//! assert!(matches!(map.advance(&mut cursor), Ok(Some((_, &1)))));
//! map.add(3);
//! assert_eq!(map.advance(&mut cursor).unwrap_err(), SlotError::Modified);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::SlotError;

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Identity for a new map instance (clones included).
pub(crate) fn next_map_id() -> u64 {
    NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCursor {
    pub(crate) position: u64,
    map_id: u64,
    mutation_version: u32,
    invalidated: bool,
}

impl SlotCursor {
    pub(crate) fn new(map_id: u64, mutation_version: u32) -> Self {
        Self {
            position: 0,
            map_id,
            mutation_version,
            invalidated: false,
        }
    }

    /// Fails, permanently, once stepped on another map or once `live`
    /// differs from the captured counter.
    #[inline]
    pub(crate) fn check(&mut self, map_id: u64, live: u32) -> Result<(), SlotError> {
        if self.invalidated || map_id != self.map_id || live != self.mutation_version {
            self.invalidated = true;
            return Err(SlotError::Modified);
        }
        Ok(())
    }

    /// Whether a previous step already failed.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Number of positions consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_is_sticky() {
        let mut cursor = SlotCursor::new(1, 7);
        assert_eq!(cursor.check(1, 7), Ok(()));
        assert!(!cursor.is_invalidated());

        assert_eq!(cursor.check(1, 8), Err(SlotError::Modified));
        assert!(cursor.is_invalidated());
        // Going back to the captured value does not revive it.
        assert_eq!(cursor.check(1, 7), Err(SlotError::Modified));
    }

    #[test]
    fn test_check_rejects_other_map() {
        let mut cursor = SlotCursor::new(1, 7);
        assert_eq!(cursor.check(2, 7), Err(SlotError::Modified));
        assert_eq!(cursor.check(1, 7), Err(SlotError::Modified));
    }

    #[test]
    fn test_map_ids_are_unique() {
        let a = next_map_id();
        let b = next_map_id();
        assert_ne!(a, b);
    }
}
