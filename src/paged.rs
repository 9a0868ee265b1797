//! Paged slot map: each value lives in the page slot its key names.

use std::collections::VecDeque;
use std::fmt;
use std::iter::{Enumerate, FusedIterator};
use std::ops::{Index, IndexMut};
use std::slice;

use crate::config::{Layout, SlotMapConfig};
use crate::cursor::{next_map_id, SlotCursor};
use crate::error::{hard_fail, ConfigError, Rejected, SlotError};
use crate::key::{KeyLayout, SlotKey, SlotVersion, Version32};
use crate::page::{Page, PageIter, PageIterMut, Retirement};

/// Generational slot map over paged storage.
///
/// Key index == storage index, so lookups are one shift, one mask and one
/// version compare. Capacity grows a page at a time and is bounded by the
/// 32-bit index range (or the configured page limit).
///
/// Every panicking method has a `try_*` twin that reports the same failure
/// as a value and otherwise behaves identically. `remove` never panics; its
/// `try_remove` twin adds the failure reason.
pub struct PagedSlotMap<V, L: KeyLayout = Version32> {
    pages: Vec<Page<V, L>>,
    /// Retired keys, oldest first, still carrying the version they died with.
    free_keys: VecDeque<SlotKey<L>>,
    layout: Layout,
    /// Indices below this have been handed out at least once.
    next_index: u64,
    slot_count: usize,
    tombstone_count: usize,
    mutation_version: u32,
    /// Identity checked by cursors; fresh for every instance.
    id: u64,
}

impl<V, L: KeyLayout> PagedSlotMap<V, L> {
    pub fn new() -> Self {
        Self::with_config(SlotMapConfig::default())
    }

    /// Panics if `page_size` is not a power of two.
    #[track_caller]
    pub fn with_page_size(page_size: u32, free_indices_limit: u32) -> Self {
        Self::with_config(
            SlotMapConfig::new()
                .with_page_size(page_size)
                .with_free_indices_limit(free_indices_limit),
        )
    }

    /// Panics if the configuration is invalid.
    #[track_caller]
    pub fn with_config(config: SlotMapConfig) -> Self {
        match Self::try_with_config(config) {
            Ok(map) => map,
            Err(error) => hard_fail(error, config),
        }
    }

    pub fn try_with_config(config: SlotMapConfig) -> Result<Self, ConfigError> {
        let layout = config.resolve()?;
        Ok(Self {
            pages: vec![Page::new(layout.page_size)],
            free_keys: VecDeque::new(),
            layout,
            next_index: 0,
            slot_count: 0,
            tombstone_count: 0,
            mutation_version: 0,
            id: next_map_id(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slot_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slot_count == 0
    }

    /// Live entries. Same as [`PagedSlotMap::len`].
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Slots permanently retired after exhausting their version.
    #[inline]
    pub fn tombstone_count(&self) -> usize {
        self.tombstone_count
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    #[inline]
    pub fn max_page_count(&self) -> u32 {
        self.layout.max_page_count
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.layout.page_size
    }

    #[inline]
    pub fn free_indices_limit(&self) -> u32 {
        self.layout.free_indices_limit
    }

    /// Retired keys waiting to be reissued.
    #[inline]
    pub fn free_key_count(&self) -> usize {
        self.free_keys.len()
    }

    /// Slots in allocated pages.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pages.len() * self.layout.page_size as usize
    }

    #[inline]
    fn touch(&mut self) {
        self.mutation_version = self.mutation_version.wrapping_add(1);
    }

    fn locate(&self, key: SlotKey<L>) -> Result<(usize, usize), SlotError> {
        if !key.is_valid() {
            return Err(SlotError::InvalidKey);
        }
        if key.index() as u64 >= self.next_index {
            return Err(SlotError::OutOfRange);
        }
        Ok(self.layout.address(key.index()))
    }

    /// How many more values fit before `add` fails.
    fn available_slots(&self) -> u64 {
        self.free_keys.len() as u64 + (self.layout.max_slots() - self.next_index)
    }

    fn fresh_index(&mut self) -> Option<u32> {
        if self.next_index >= self.layout.max_slots() {
            return None;
        }
        if self.next_index == self.pages.len() as u64 * self.layout.page_size as u64 {
            self.pages.push(Page::new(self.layout.page_size));
            log::debug!(
                "allocated page {} of {}",
                self.pages.len(),
                self.layout.max_page_count
            );
        }
        let index = self.next_index as u32;
        self.next_index += 1;
        Some(index)
    }

    /// Recycles the oldest retired key once more than `free_indices_limit`
    /// are queued; otherwise takes a never-used index. Falls back to the
    /// queue when no fresh index is left.
    fn allocate_key(&mut self) -> Option<SlotKey<L>> {
        if self.free_keys.len() > self.layout.free_indices_limit as usize {
            return self.free_keys.pop_front().map(SlotKey::recycled);
        }
        match self.fresh_index() {
            Some(index) => Some(SlotKey::new(index, SlotVersion::MIN)),
            None => self.free_keys.pop_front().map(SlotKey::recycled),
        }
    }

    fn retire(&mut self, key: SlotKey<L>, retirement: Retirement) {
        match retirement {
            Retirement::Recycle => self.free_keys.push_back(key),
            Retirement::Tombstone => {
                self.tombstone_count += 1;
                log::trace!("slot {} tombstoned at {:?}", key.index(), key.version());
            }
        }
    }

    // === Read side ===

    pub fn contains(&self, key: SlotKey<L>) -> bool {
        match self.locate(key) {
            Ok((page, slot)) => self.pages[page].contains(slot, key),
            Err(_) => false,
        }
    }

    pub fn try_get(&self, key: SlotKey<L>) -> Result<&V, SlotError> {
        let (page, slot) = self.locate(key)?;
        self.pages[page].get(slot, key)
    }

    pub fn try_get_mut(&mut self, key: SlotKey<L>) -> Result<&mut V, SlotError> {
        let (page, slot) = self.locate(key)?;
        self.pages[page].get_mut(slot, key)
    }

    pub fn get_or_none(&self, key: SlotKey<L>) -> Option<&V> {
        self.try_get(key).ok()
    }

    pub fn get_mut_or_none(&mut self, key: SlotKey<L>) -> Option<&mut V> {
        self.try_get_mut(key).ok()
    }

    /// Panics if `key` is stale or was never issued here.
    #[track_caller]
    pub fn get(&self, key: SlotKey<L>) -> &V {
        match self.try_get(key) {
            Ok(value) => value,
            Err(error) => hard_fail(error, key),
        }
    }

    #[track_caller]
    pub fn get_mut(&mut self, key: SlotKey<L>) -> &mut V {
        match self.try_get_mut(key) {
            Ok(value) => value,
            Err(error) => hard_fail(error, key),
        }
    }

    // === Write side ===

    pub fn try_add(&mut self, value: V) -> Result<SlotKey<L>, Rejected<V>> {
        let key = match self.allocate_key() {
            Some(key) => key,
            None => return Err(Rejected::new(SlotError::CapacityExhausted, value)),
        };
        let (page, slot) = self.layout.address(key.index());
        if let Err(rejected) = self.pages[page].add(slot, key, value) {
            hard_fail(
                format_args!("slot map corrupted, allocated key rejected ({})", rejected.error),
                key,
            );
        }
        self.slot_count += 1;
        self.touch();
        Ok(key)
    }

    /// Panics once capacity is exhausted.
    #[track_caller]
    pub fn add(&mut self, value: V) -> SlotKey<L> {
        match self.try_add(value) {
            Ok(key) => key,
            Err(rejected) => hard_fail(rejected.error, self.layout.max_slots()),
        }
    }

    /// Overwrites the value under `key` and returns its successor key; `key`
    /// goes stale. The tag carries over.
    ///
    /// When the slot's version is exhausted the slot is tombstoned and the
    /// value moves to a newly allocated slot, whose key is returned.
    pub fn try_replace(&mut self, key: SlotKey<L>, value: V) -> Result<SlotKey<L>, Rejected<V>> {
        let (page, slot) = match self.locate(key) {
            Ok(address) => address,
            Err(error) => return Err(Rejected::new(error, value)),
        };
        match self.pages[page].replace(slot, key, value) {
            Ok((new_key, _)) => {
                self.touch();
                Ok(new_key)
            }
            Err(Rejected {
                error: SlotError::VersionExhausted,
                value,
            }) => self.relocate(key, value),
            Err(rejected) => Err(rejected),
        }
    }

    #[track_caller]
    pub fn replace(&mut self, key: SlotKey<L>, value: V) -> SlotKey<L> {
        match self.try_replace(key, value) {
            Ok(new_key) => new_key,
            Err(rejected) => hard_fail(rejected.error, key),
        }
    }

    fn relocate(&mut self, key: SlotKey<L>, value: V) -> Result<SlotKey<L>, Rejected<V>> {
        if self.available_slots() == 0 {
            return Err(Rejected::new(SlotError::CapacityExhausted, value));
        }
        // Exhausted version: removal tombstones the slot.
        if let Err(error) = self.try_remove(key) {
            return Err(Rejected::new(error, value));
        }
        let moved = self.try_add(value)?;
        Ok(moved.try_with_tag(key.tag()).unwrap_or(moved))
    }

    pub fn try_remove(&mut self, key: SlotKey<L>) -> Result<V, SlotError> {
        let (page, slot) = self.locate(key)?;
        let (value, retirement) = self.pages[page].remove(slot, key)?;
        self.slot_count -= 1;
        self.retire(key, retirement);
        self.touch();
        Ok(value)
    }

    /// Removes the value under `key`. A stale or foreign key is not an
    /// error here: it yields `None` and leaves the map untouched.
    pub fn remove(&mut self, key: SlotKey<L>) -> Option<V> {
        self.try_remove(key).ok()
    }

    /// Removes every value. Versions survive, so old keys stay stale.
    pub fn clear(&mut self) {
        self.drain().for_each(drop);
    }

    /// Drops every page but one and forgets all slot history.
    ///
    /// Keys issued before the reset must not be used afterwards: versions
    /// restart, so they may alias new entries.
    pub fn reset(&mut self) {
        self.reset_pages(1);
    }

    /// Like [`PagedSlotMap::reset`], keeping enough pages for `capacity`.
    pub fn reset_with_capacity(&mut self, capacity: usize) {
        let pages = self.layout.pages_for(capacity);
        self.reset_pages(pages);
    }

    fn reset_pages(&mut self, count: u32) {
        let page_size = self.layout.page_size;
        self.pages.clear();
        self.pages.extend((0..count).map(|_| Page::new(page_size)));
        self.free_keys.clear();
        self.next_index = 0;
        self.slot_count = 0;
        self.tombstone_count = 0;
        self.touch();
        log::debug!("reset to {count} page(s)");
    }

    // === Bulk ===

    /// Adds clones of `values`, writing their keys to the front of `keys`.
    /// Checks buffer length and remaining capacity before adding anything.
    pub fn try_add_range(&mut self, values: &[V], keys: &mut [SlotKey<L>]) -> Result<(), SlotError>
    where
        V: Clone,
    {
        if keys.len() < values.len() {
            return Err(SlotError::BufferTooSmall {
                needed: values.len(),
                available: keys.len(),
            });
        }
        if self.available_slots() < values.len() as u64 {
            return Err(SlotError::CapacityExhausted);
        }
        for (value, out) in values.iter().zip(keys.iter_mut()) {
            *out = self.try_add(value.clone())?;
        }
        Ok(())
    }

    #[track_caller]
    pub fn add_range(&mut self, values: &[V], keys: &mut [SlotKey<L>])
    where
        V: Clone,
    {
        if let Err(error) = self.try_add_range(values, keys) {
            hard_fail(error, values.len());
        }
    }

    /// Adds every value, collecting the keys. Panics once capacity runs out.
    #[track_caller]
    pub fn add_all<I: IntoIterator<Item = V>>(&mut self, values: I) -> Vec<SlotKey<L>> {
        values.into_iter().map(|value| self.add(value)).collect()
    }

    /// Clones the values under `keys` into the front of `out`. Writes
    /// nothing unless every key is live.
    pub fn try_get_range(&self, keys: &[SlotKey<L>], out: &mut [V]) -> Result<(), SlotError>
    where
        V: Clone,
    {
        if out.len() < keys.len() {
            return Err(SlotError::BufferTooSmall {
                needed: keys.len(),
                available: out.len(),
            });
        }
        for &key in keys {
            self.try_get(key)?;
        }
        for (&key, out) in keys.iter().zip(out.iter_mut()) {
            out.clone_from(self.try_get(key)?);
        }
        Ok(())
    }

    #[track_caller]
    pub fn get_range(&self, keys: &[SlotKey<L>], out: &mut [V])
    where
        V: Clone,
    {
        if let Err(error) = self.try_get_range(keys, out) {
            hard_fail(error, keys);
        }
    }

    /// Removes every live key in `keys`, skipping stale ones. Returns how
    /// many were removed.
    pub fn remove_range(&mut self, keys: &[SlotKey<L>]) -> usize {
        keys.iter()
            .filter(|&&key| self.try_remove(key).is_ok())
            .count()
    }

    /// Removes `keys`, moving each value into the matching entry of `out`
    /// (`None` for stale keys). Returns how many were removed.
    pub fn try_remove_range(
        &mut self,
        keys: &[SlotKey<L>],
        out: &mut [Option<V>],
    ) -> Result<usize, SlotError> {
        if out.len() < keys.len() {
            return Err(SlotError::BufferTooSmall {
                needed: keys.len(),
                available: out.len(),
            });
        }
        let mut removed = 0;
        for (&key, out) in keys.iter().zip(out.iter_mut()) {
            *out = self.try_remove(key).ok();
            removed += out.is_some() as usize;
        }
        Ok(removed)
    }

    // === Iteration ===

    pub fn iter(&self) -> Iter<'_, V, L> {
        Iter {
            pages: self.pages.iter().enumerate(),
            current: None,
            page_size: self.layout.page_size,
            remaining: self.slot_count,
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, V, L> {
        IterMut {
            pages: self.pages.iter_mut().enumerate(),
            current: None,
            page_size: self.layout.page_size,
            remaining: self.slot_count,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = SlotKey<L>> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.iter_mut().map(|(_, value)| value)
    }

    /// Removes and yields every entry in index order. Entries not consumed
    /// are removed when the iterator drops.
    pub fn drain(&mut self) -> Drain<'_, V, L> {
        Drain {
            map: self,
            index: 0,
        }
    }

    /// A detached cursor positioned before the first slot.
    pub fn cursor(&self) -> SlotCursor {
        SlotCursor::new(self.id, self.mutation_version)
    }

    /// Steps `cursor` to the next live entry. Fails with
    /// [`SlotError::Modified`] if the map changed since the cursor was made
    /// or the cursor came from another map.
    pub fn advance(&self, cursor: &mut SlotCursor) -> Result<Option<(SlotKey<L>, &V)>, SlotError> {
        cursor.check(self.id, self.mutation_version)?;
        while cursor.position < self.next_index {
            let index = cursor.position as u32;
            cursor.position += 1;
            let (page, slot) = self.layout.address(index);
            let meta = self.pages[page].meta(slot);
            if meta.is_occupied() {
                let key = SlotKey::new(index, meta.version());
                return Ok(Some((key, self.pages[page].get(slot, key)?)));
            }
        }
        Ok(None)
    }
}

impl<V, L: KeyLayout> Default for PagedSlotMap<V, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone, L: KeyLayout> Clone for PagedSlotMap<V, L> {
    fn clone(&self) -> Self {
        Self {
            pages: self.pages.clone(),
            free_keys: self.free_keys.clone(),
            layout: self.layout,
            next_index: self.next_index,
            slot_count: self.slot_count,
            tombstone_count: self.tombstone_count,
            mutation_version: self.mutation_version,
            id: next_map_id(),
        }
    }
}

impl<V: fmt::Debug, L: KeyLayout> fmt::Debug for PagedSlotMap<V, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<V, L: KeyLayout> Index<SlotKey<L>> for PagedSlotMap<V, L> {
    type Output = V;

    #[track_caller]
    fn index(&self, key: SlotKey<L>) -> &V {
        self.get(key)
    }
}

impl<V, L: KeyLayout> IndexMut<SlotKey<L>> for PagedSlotMap<V, L> {
    #[track_caller]
    fn index_mut(&mut self, key: SlotKey<L>) -> &mut V {
        self.get_mut(key)
    }
}

impl<'a, V, L: KeyLayout> IntoIterator for &'a PagedSlotMap<V, L> {
    type Item = (SlotKey<L>, &'a V);
    type IntoIter = Iter<'a, V, L>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, V, L: KeyLayout> IntoIterator for &'a mut PagedSlotMap<V, L> {
    type Item = (SlotKey<L>, &'a mut V);
    type IntoIter = IterMut<'a, V, L>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

// =============================================================================
// Iterators
// =============================================================================

pub struct Iter<'a, V, L: KeyLayout = Version32> {
    pages: Enumerate<slice::Iter<'a, Page<V, L>>>,
    current: Option<PageIter<'a, V, L>>,
    page_size: u32,
    remaining: usize,
}

impl<'a, V, L: KeyLayout> Iterator for Iter<'a, V, L> {
    type Item = (SlotKey<L>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            if let Some(entry) = self.current.as_mut().and_then(Iterator::next) {
                self.remaining -= 1;
                return Some(entry);
            }
            let (page_index, page) = self.pages.next()?;
            self.current = Some(page.iter(page_index as u32 * self.page_size));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V, L: KeyLayout> ExactSizeIterator for Iter<'_, V, L> {}
impl<V, L: KeyLayout> FusedIterator for Iter<'_, V, L> {}

pub struct IterMut<'a, V, L: KeyLayout = Version32> {
    pages: Enumerate<slice::IterMut<'a, Page<V, L>>>,
    current: Option<PageIterMut<'a, V, L>>,
    page_size: u32,
    remaining: usize,
}

impl<'a, V, L: KeyLayout> Iterator for IterMut<'a, V, L> {
    type Item = (SlotKey<L>, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            if let Some(entry) = self.current.as_mut().and_then(Iterator::next) {
                self.remaining -= 1;
                return Some(entry);
            }
            let (page_index, page) = self.pages.next()?;
            self.current = Some(page.iter_mut(page_index as u32 * self.page_size));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V, L: KeyLayout> ExactSizeIterator for IterMut<'_, V, L> {}
impl<V, L: KeyLayout> FusedIterator for IterMut<'_, V, L> {}

pub struct Drain<'a, V, L: KeyLayout = Version32> {
    map: &'a mut PagedSlotMap<V, L>,
    index: u64,
}

impl<V, L: KeyLayout> Iterator for Drain<'_, V, L> {
    type Item = (SlotKey<L>, V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.map.next_index {
            let index = self.index as u32;
            self.index += 1;
            let (page, slot) = self.map.layout.address(index);
            let meta = self.map.pages[page].meta(slot);
            if meta.is_occupied() {
                let key = SlotKey::new(index, meta.version());
                if let Ok(value) = self.map.try_remove(key) {
                    return Some((key, value));
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.map.slot_count, Some(self.map.slot_count))
    }
}

impl<V, L: KeyLayout> Drop for Drain<'_, V, L> {
    fn drop(&mut self) {
        self.by_ref().for_each(drop);
    }
}

// =============================================================================
// Consistency checks
// =============================================================================

#[cfg(test)]
impl<V, L: KeyLayout> PagedSlotMap<V, L> {
    pub(crate) fn assert_invariants(&self) {
        use crate::key::SlotState;
        use std::collections::HashSet;

        assert!(self.pages.len() as u32 <= self.layout.max_page_count);
        assert!(!self.pages.is_empty(), "at least one page stays allocated");
        assert!(self.next_index <= self.capacity() as u64);

        let mut occupied = 0;
        let mut tombstones = 0;
        for index in 0..self.capacity() as u64 {
            let (page, slot) = self.layout.address(index as u32);
            let meta = self.pages[page].meta(slot);
            match meta.state() {
                SlotState::Occupied => occupied += 1,
                SlotState::Tombstone => tombstones += 1,
                SlotState::Empty => {}
            }
            if index >= self.next_index {
                assert_eq!(meta.state(), SlotState::Empty, "unissued slot {index} touched");
                assert!(!meta.version().is_valid(), "unissued slot {index} has a version");
            }
        }
        assert_eq!(occupied, self.slot_count, "slot_count out of sync");
        assert_eq!(tombstones, self.tombstone_count, "tombstone_count out of sync");

        let mut seen = HashSet::new();
        for key in &self.free_keys {
            assert!(seen.insert(key.index()), "index {} queued twice", key.index());
            let (page, slot) = self.layout.address(key.index());
            let meta = self.pages[page].meta(slot);
            assert_eq!(meta.state(), SlotState::Empty, "queued slot must be empty");
            assert_eq!(meta.version(), key.version(), "queued key must carry the last version");
            assert!(!key.version().is_max(), "exhausted versions never queue");
        }
        assert_eq!(self.iter().count(), self.slot_count);
    }
}
