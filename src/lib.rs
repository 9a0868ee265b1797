//! # paged-slotmap
//!
//! Generational slot maps: containers that hand out versioned keys for the
//! values they store, with O(1) add, lookup, replace and removal, and
//! detection of stale keys after a slot is reused.
//!
//! Two variants share the same key type and API:
//!
//! - [`PagedSlotMap`]: values live next to their metadata; key index ==
//!   storage index.
//! - [`SparseSlotMap`]: stable sparse metadata plus densely packed values,
//!   kept compact by swap-remove, for cache-friendly iteration.
//!
//! Storage grows by appending fixed-size pages instead of reallocating one
//! large buffer.
//!
//! ## Example
//!
//! ```rust
//! use paged_slotmap::PagedSlotMap;
//!
//! let mut map: PagedSlotMap<&str> = PagedSlotMap::new();
//! let a = map.add("a");
//! let b = map.add("b");
//!
//! assert_eq!(map.get(a), &"a");
//! assert_eq!(map.remove(b), Some("b"));
//! assert_eq!(map.remove(b), None);
//! assert!(map.try_get(b).is_err());
//!
//! let a2 = map.replace(a, "A");
//! assert_eq!(map.get_or_none(a), None);
//! assert_eq!(map[a2], "A");
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod key;
mod page;
pub mod paged;
pub mod sparse;

pub use config::SlotMapConfig;
pub use cursor::SlotCursor;
pub use error::{ConfigError, Rejected, SlotError};
pub use key::{KeyLayout, SlotKey, SlotVersion, Tagged16, Tagged30, Version16, Version32, Version8};
pub use paged::PagedSlotMap;
pub use sparse::SparseSlotMap;

// =============================================================================
// Configuration
// =============================================================================

/// Slots per page when none is given.
pub const DEFAULT_PAGE_SIZE: u32 = 1024;
/// Queued retired keys held back from reuse when none is given.
pub const DEFAULT_FREE_INDICES_LIMIT: u32 = 32;
/// Largest slot index a key can carry.
pub const MAX_INDEX: u32 = u32::MAX;

// =============================================================================
// Paging utilities
// =============================================================================

/// `true` for 1, 2, 4, ...; `false` for 0.
#[inline]
pub const fn is_power_of_two(x: u32) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

/// Splits a slot index into `(page, slot within page)`.
///
/// `page_size` must be a power of two.
#[inline]
pub fn to_address(index: u32, page_size: u32) -> (u32, u32) {
    debug_assert!(is_power_of_two(page_size));
    (index >> page_size.trailing_zeros(), index & (page_size - 1))
}

/// Number of pages needed to cover the index range: `ceil(MAX_INDEX / page_size)`.
#[inline]
pub const fn max_page_count(page_size: u32) -> u32 {
    MAX_INDEX.div_ceil(page_size)
}


#[cfg(test)]
mod proptests;
