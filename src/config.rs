//! Construction parameters shared by both container variants.

use crate::error::ConfigError;
use crate::{is_power_of_two, max_page_count, DEFAULT_FREE_INDICES_LIMIT, DEFAULT_PAGE_SIZE};

/// How a slot map lays out and recycles its storage.
///
/// ```rust
/// use paged_slotmap::{PagedSlotMap, SlotMapConfig};
///
/// let config = SlotMapConfig::new().with_page_size(64).with_free_indices_limit(8);
/// let map: PagedSlotMap<u32> = PagedSlotMap::with_config(config);
/// assert_eq!(map.page_size(), 64);
/// assert_eq!(map.free_indices_limit(), 8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMapConfig {
    /// Slots per page. Must be a non-zero power of two.
    pub page_size: u32,
    /// Retired keys are reissued only once more than this many are queued.
    /// Clamped to `page_size`.
    pub free_indices_limit: u32,
    /// Upper bound on allocated pages. `None` uses the largest count the
    /// 32-bit index range can address.
    pub max_page_count: Option<u32>,
}

impl Default for SlotMapConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            free_indices_limit: DEFAULT_FREE_INDICES_LIMIT,
            max_page_count: None,
        }
    }
}

impl SlotMapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_free_indices_limit(mut self, free_indices_limit: u32) -> Self {
        self.free_indices_limit = free_indices_limit;
        self
    }

    pub fn with_max_page_count(mut self, max_page_count: u32) -> Self {
        self.max_page_count = Some(max_page_count);
        self
    }

    pub(crate) fn resolve(&self) -> Result<Layout, ConfigError> {
        if !is_power_of_two(self.page_size) {
            return Err(ConfigError::PageSizeNotPowerOfTwo(self.page_size));
        }

        let free_indices_limit = if self.free_indices_limit > self.page_size {
            log::warn!(
                "free_indices_limit {} exceeds page size {}, clamping",
                self.free_indices_limit,
                self.page_size
            );
            self.page_size
        } else {
            self.free_indices_limit
        };

        let bound = max_page_count(self.page_size);
        let max_pages = match self.max_page_count {
            None => bound,
            Some(requested) if (1..=bound).contains(&requested) => requested,
            Some(requested) => {
                let clamped = requested.clamp(1, bound);
                log::warn!("max_page_count {requested} out of range, clamping to {clamped}");
                clamped
            }
        };

        Ok(Layout {
            page_size: self.page_size,
            page_shift: self.page_size.trailing_zeros(),
            free_indices_limit,
            max_page_count: max_pages,
        })
    }
}

/// Validated form of a [`SlotMapConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub(crate) page_size: u32,
    pub(crate) page_shift: u32,
    pub(crate) free_indices_limit: u32,
    pub(crate) max_page_count: u32,
}

impl Layout {
    /// `index -> (page, slot)`.
    #[inline]
    pub(crate) fn address(&self, index: u32) -> (usize, usize) {
        (
            (index >> self.page_shift) as usize,
            (index & (self.page_size - 1)) as usize,
        )
    }

    /// Total number of indices the page bound can address.
    #[inline]
    pub(crate) fn max_slots(&self) -> u64 {
        self.max_page_count as u64 * self.page_size as u64
    }

    /// Pages needed for `capacity` slots, at least one, at most the bound.
    pub(crate) fn pages_for(&self, capacity: usize) -> u32 {
        let wanted = (capacity as u64).div_ceil(self.page_size as u64).max(1);
        if wanted > self.max_page_count as u64 {
            log::warn!(
                "capacity {capacity} exceeds {} slots, clamping",
                self.max_slots()
            );
            self.max_page_count
        } else {
            wanted as u32
        }
    }
}
