//! Sparse slot map: stable sparse metadata, densely packed values.
//!
//! Keys index the sparse side, whose slots never move. Each occupied sparse
//! slot points at a dense position; each dense position points back at its
//! sparse slot. Removal moves the last dense value into the hole and
//! re-points its sparse slot, so values `0..len` are always contiguous.

use std::collections::VecDeque;
use std::fmt;
use std::iter::{FusedIterator, Zip};
use std::ops::{Index, IndexMut};
use std::slice;

use crate::config::{Layout, SlotMapConfig};
use crate::cursor::{next_map_id, SlotCursor};
use crate::error::{hard_fail, ConfigError, Rejected, SlotError};
use crate::key::{KeyLayout, SlotKey, SlotVersion, Version32};
use crate::page::{Page, Retirement};

/// Sparse pages hold the dense position of each occupied slot as its value.
type MetaPage<L> = Page<u32, L>;

struct ValuePage<V> {
    values: Box<[Option<V>]>,
    /// Sparse slot owning each dense position.
    back_index: Box<[u32]>,
}

impl<V> ValuePage<V> {
    fn new(page_size: u32) -> Self {
        let len = page_size as usize;
        Self {
            values: std::iter::repeat_with(|| None).take(len).collect(),
            back_index: vec![0; len].into_boxed_slice(),
        }
    }
}

impl<V: Clone> Clone for ValuePage<V> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            back_index: self.back_index.clone(),
        }
    }
}

#[cold]
#[track_caller]
fn linkage_corrupted(detail: fmt::Arguments<'_>) -> ! {
    panic!("sparse slot map linkage corrupted: {detail}")
}

/// Generational slot map with dense value storage.
///
/// Same contract as [`crate::PagedSlotMap`]. Iteration walks a contiguous
/// run of values; removal costs one extra move and one back-pointer fixup.
/// Iteration order is dense order, which removals reshuffle.
pub struct SparseSlotMap<V, L: KeyLayout = Version32> {
    meta_pages: Vec<MetaPage<L>>,
    value_pages: Vec<ValuePage<V>>,
    free_keys: VecDeque<SlotKey<L>>,
    layout: Layout,
    next_index: u64,
    /// Filled dense positions; also the live entry count.
    dense_len: usize,
    tombstone_count: usize,
    mutation_version: u32,
    /// Identity checked by cursors; fresh for every instance.
    id: u64,
}

impl<V, L: KeyLayout> SparseSlotMap<V, L> {
    pub fn new() -> Self {
        Self::with_config(SlotMapConfig::default())
    }

    #[track_caller]
    pub fn with_page_size(page_size: u32, free_indices_limit: u32) -> Self {
        Self::with_config(
            SlotMapConfig::new()
                .with_page_size(page_size)
                .with_free_indices_limit(free_indices_limit),
        )
    }

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
            meta_pages: vec![MetaPage::new(layout.page_size)],
            value_pages: vec![ValuePage::new(layout.page_size)],
            free_keys: VecDeque::new(),
            layout,
            next_index: 0,
            dense_len: 0,
            tombstone_count: 0,
            mutation_version: 0,
            id: next_map_id(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dense_len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dense_len == 0
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.dense_len
    }

    /// Filled dense positions. Always equal to [`SparseSlotMap::len`].
    #[inline]
    pub fn dense_len(&self) -> usize {
        self.dense_len
    }

    #[inline]
    pub fn tombstone_count(&self) -> usize {
        self.tombstone_count
    }

    /// Allocated sparse pages.
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.meta_pages.len() as u32
    }

    /// Allocated dense pages; never more than [`SparseSlotMap::page_count`].
    #[inline]
    pub fn value_page_count(&self) -> u32 {
        self.value_pages.len() as u32
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

    #[inline]
    pub fn free_key_count(&self) -> usize {
        self.free_keys.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.meta_pages.len() * self.layout.page_size as usize
    }

    #[inline]
    fn touch(&mut self) {
        self.mutation_version = self.mutation_version.wrapping_add(1);
    }

    #[inline]
    fn dense_address(&self, position: usize) -> (usize, usize) {
        self.layout.address(position as u32)
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

    fn available_slots(&self) -> u64 {
        self.free_keys.len() as u64 + (self.layout.max_slots() - self.next_index)
    }

    fn fresh_index(&mut self) -> Option<u32> {
        if self.next_index >= self.layout.max_slots() {
            return None;
        }
        if self.next_index == self.capacity() as u64 {
            self.meta_pages.push(MetaPage::new(self.layout.page_size));
            log::debug!(
                "allocated sparse page {} of {}",
                self.meta_pages.len(),
                self.layout.max_page_count
            );
        }
        let index = self.next_index as u32;
        self.next_index += 1;
        Some(index)
    }

    fn allocate_key(&mut self) -> Option<SlotKey<L>> {
        if self.free_keys.len() > self.layout.free_indices_limit as usize {
            return self.free_keys.pop_front().map(SlotKey::recycled);
        }
        match self.fresh_index() {
            Some(index) => Some(SlotKey::new(index, SlotVersion::MIN)),
            None => self.free_keys.pop_front().map(SlotKey::recycled),
        }
    }

    /// Dense position of a live key.
    fn position_of(&self, key: SlotKey<L>) -> Result<usize, SlotError> {
        let (page, slot) = self.locate(key)?;
        self.meta_pages[page].get(slot, key).map(|&position| position as usize)
    }

    fn dense_value(&self, position: usize) -> &V {
        let (page, slot) = self.dense_address(position);
        match self.value_pages[page].values[slot].as_ref() {
            Some(value) => value,
            None => linkage_corrupted(format_args!("dense position {position} is empty")),
        }
    }

    fn dense_value_mut(&mut self, position: usize) -> &mut V {
        let (page, slot) = self.dense_address(position);
        match self.value_pages[page].values[slot].as_mut() {
            Some(value) => value,
            None => linkage_corrupted(format_args!("dense position {position} is empty")),
        }
    }

    fn back_index(&self, position: usize) -> u32 {
        let (page, slot) = self.dense_address(position);
        self.value_pages[page].back_index[slot]
    }

    /// Sparse slot owning the dense position `position`, checked both ways.
    fn verified_owner(&self, position: usize) -> u32 {
        let owner = self.back_index(position);
        let (page, slot) = self.layout.address(owner);
        let meta = match self.meta_pages.get(page) {
            Some(meta_page) => meta_page.meta(slot),
            None => linkage_corrupted(format_args!(
                "dense position {position} points at unallocated slot {owner}"
            )),
        };
        let key = SlotKey::new(owner, meta.version());
        match self.meta_pages[page].get(slot, key) {
            Ok(&linked) if linked as usize == position => owner,
            Ok(&linked) => linkage_corrupted(format_args!(
                "slot {owner} points at dense position {linked}, expected {position}"
            )),
            Err(error) => linkage_corrupted(format_args!(
                "dense position {position} owned by {error} slot {owner}"
            )),
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
        self.position_of(key).is_ok()
    }

    pub fn try_get(&self, key: SlotKey<L>) -> Result<&V, SlotError> {
        let position = self.position_of(key)?;
        Ok(self.dense_value(position))
    }

    pub fn try_get_mut(&mut self, key: SlotKey<L>) -> Result<&mut V, SlotError> {
        let position = self.position_of(key)?;
        Ok(self.dense_value_mut(position))
    }

    pub fn get_or_none(&self, key: SlotKey<L>) -> Option<&V> {
        self.try_get(key).ok()
    }

    pub fn get_mut_or_none(&mut self, key: SlotKey<L>) -> Option<&mut V> {
        self.try_get_mut(key).ok()
    }

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

        let position = self.dense_len;
        let (value_page, value_slot) = self.dense_address(position);
        if value_page == self.value_pages.len() {
            self.value_pages.push(ValuePage::new(self.layout.page_size));
            log::debug!("allocated dense page {}", self.value_pages.len());
        }

        let (meta_page, meta_slot) = self.layout.address(key.index());
        if let Err(rejected) = self.meta_pages[meta_page].add(meta_slot, key, position as u32) {
            hard_fail(
                format_args!("slot map corrupted, allocated key rejected ({})", rejected.error),
                key,
            );
        }
        let dense = &mut self.value_pages[value_page];
        dense.values[value_slot] = Some(value);
        dense.back_index[value_slot] = key.index();

        self.dense_len += 1;
        self.touch();
        Ok(key)
    }

    #[track_caller]
    pub fn add(&mut self, value: V) -> SlotKey<L> {
        match self.try_add(value) {
            Ok(key) => key,
            Err(rejected) => hard_fail(rejected.error, self.layout.max_slots()),
        }
    }

    /// Overwrites the value under `key` in place and returns its successor
    /// key. On an exhausted version the slot is tombstoned and the value
    /// moves to a new slot.
    pub fn try_replace(&mut self, key: SlotKey<L>, value: V) -> Result<SlotKey<L>, Rejected<V>> {
        let position = match self.position_of(key) {
            Ok(position) => position,
            Err(error) => return Err(Rejected::new(error, value)),
        };
        let (page, slot) = self.layout.address(key.index());
        match self.meta_pages[page].replace(slot, key, position as u32) {
            Ok((new_key, _)) => {
                *self.dense_value_mut(position) = value;
                self.touch();
                Ok(new_key)
            }
            Err(Rejected {
                error: SlotError::VersionExhausted,
                ..
            }) => self.relocate(key, value),
            Err(rejected) => Err(Rejected::new(rejected.error, value)),
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
        if let Err(error) = self.try_remove(key) {
            return Err(Rejected::new(error, value));
        }
        let moved = self.try_add(value)?;
        Ok(moved.try_with_tag(key.tag()).unwrap_or(moved))
    }

    /// Removes the value under `key`, closing the dense hole with the last
    /// dense value.
    pub fn try_remove(&mut self, key: SlotKey<L>) -> Result<V, SlotError> {
        let hole = self.position_of(key)?;
        let last = self.dense_len - 1;

        // Check both links before touching anything.
        if self.verified_owner(hole) != key.index() {
            linkage_corrupted(format_args!(
                "dense position {hole} not owned by slot {}",
                key.index()
            ));
        }
        let moved_owner = self.verified_owner(last);

        let (meta_page, meta_slot) = self.layout.address(key.index());
        let (_, retirement) = match self.meta_pages[meta_page].remove(meta_slot, key) {
            Ok(removed) => removed,
            Err(error) => linkage_corrupted(format_args!("validated slot refused removal ({error})")),
        };

        let (last_page, last_slot) = self.dense_address(last);
        let moved_value = match self.value_pages[last_page].values[last_slot].take() {
            Some(value) => value,
            None => linkage_corrupted(format_args!("dense position {last} is empty")),
        };

        let removed = if hole == last {
            moved_value
        } else {
            let (hole_page, hole_slot) = self.dense_address(hole);
            let dense = &mut self.value_pages[hole_page];
            dense.back_index[hole_slot] = moved_owner;
            let removed = dense.values[hole_slot].replace(moved_value);

            let (owner_page, owner_slot) = self.layout.address(moved_owner);
            match self.meta_pages[owner_page].value_mut(owner_slot) {
                Some(position) => *position = hole as u32,
                None => linkage_corrupted(format_args!("moved owner {moved_owner} is vacant")),
            }

            match removed {
                Some(value) => value,
                None => linkage_corrupted(format_args!("dense position {hole} is empty")),
            }
        };

        self.dense_len -= 1;
        self.retire(key, retirement);
        self.touch();
        Ok(removed)
    }

    /// Removes the value under `key`. A stale or foreign key is not an
    /// error here: it yields `None` and leaves the map untouched.
    pub fn remove(&mut self, key: SlotKey<L>) -> Option<V> {
        self.try_remove(key).ok()
    }

    /// Removes every value. Versions survive, so old keys stay stale.
    pub fn clear(&mut self) {
        while self.dense_len > 0 {
            let key = self.key_at(self.dense_len - 1);
            if let Err(error) = self.try_remove(key) {
                linkage_corrupted(format_args!("live entry refused removal ({error})"));
            }
        }
    }

    /// Drops every page but one and forgets all slot history. Keys issued
    /// before the reset must not be used afterwards.
    pub fn reset(&mut self) {
        self.reset_pages(1);
    }

    pub fn reset_with_capacity(&mut self, capacity: usize) {
        let pages = self.layout.pages_for(capacity);
        self.reset_pages(pages);
    }

    fn reset_pages(&mut self, count: u32) {
        let page_size = self.layout.page_size;
        self.meta_pages.clear();
        self.meta_pages.extend((0..count).map(|_| MetaPage::new(page_size)));
        self.value_pages.clear();
        self.value_pages.extend((0..count).map(|_| ValuePage::new(page_size)));
        self.free_keys.clear();
        self.next_index = 0;
        self.dense_len = 0;
        self.tombstone_count = 0;
        self.touch();
        log::debug!("reset to {count} page(s)");
    }

    /// Key of the entry at dense position `position`.
    fn key_at(&self, position: usize) -> SlotKey<L> {
        let owner = self.back_index(position);
        let (page, slot) = self.layout.address(owner);
        SlotKey::new(owner, self.meta_pages[page].meta(slot).version())
    }

    // === Bulk ===

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

    #[track_caller]
    pub fn add_all<I: IntoIterator<Item = V>>(&mut self, values: I) -> Vec<SlotKey<L>> {
        values.into_iter().map(|value| self.add(value)).collect()
    }

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
            self.position_of(key)?;
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

    pub fn remove_range(&mut self, keys: &[SlotKey<L>]) -> usize {
        keys.iter()
            .filter(|&&key| self.try_remove(key).is_ok())
            .count()
    }

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

    /// Entries in dense order.
    pub fn iter(&self) -> Iter<'_, V, L> {
        Iter {
            map: self,
            position: 0,
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, V, L> {
        IterMut {
            meta_pages: &self.meta_pages,
            layout: self.layout,
            pages: self.value_pages.iter_mut(),
            current: None,
            remaining: self.dense_len,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = SlotKey<L>> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Values in dense order, without touching the sparse side.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        (0..self.dense_len).map(move |position| self.dense_value(position))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.value_pages
            .iter_mut()
            .flat_map(|page| page.values.iter_mut())
            .take(self.dense_len)
            .filter_map(Option::as_mut)
    }

    /// Removes and yields every entry, last dense position first. Entries
    /// not consumed are removed when the iterator drops.
    pub fn drain(&mut self) -> Drain<'_, V, L> {
        Drain { map: self }
    }

    pub fn cursor(&self) -> SlotCursor {
        SlotCursor::new(self.id, self.mutation_version)
    }

    /// Steps `cursor` through dense positions. Fails with
    /// [`SlotError::Modified`] once the map changed; a swap-remove may have
    /// moved values the cursor has not reached yet.
    pub fn advance(&self, cursor: &mut SlotCursor) -> Result<Option<(SlotKey<L>, &V)>, SlotError> {
        cursor.check(self.id, self.mutation_version)?;
        if cursor.position >= self.dense_len as u64 {
            return Ok(None);
        }
        let position = cursor.position as usize;
        cursor.position += 1;
        Ok(Some((self.key_at(position), self.dense_value(position))))
    }
}

impl<V, L: KeyLayout> Default for SparseSlotMap<V, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone, L: KeyLayout> Clone for SparseSlotMap<V, L> {
    fn clone(&self) -> Self {
        Self {
            meta_pages: self.meta_pages.clone(),
            value_pages: self.value_pages.clone(),
            free_keys: self.free_keys.clone(),
            layout: self.layout,
            next_index: self.next_index,
            dense_len: self.dense_len,
            tombstone_count: self.tombstone_count,
            mutation_version: self.mutation_version,
            id: next_map_id(),
        }
    }
}

impl<V: fmt::Debug, L: KeyLayout> fmt::Debug for SparseSlotMap<V, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<V, L: KeyLayout> Index<SlotKey<L>> for SparseSlotMap<V, L> {
    type Output = V;

    #[track_caller]
    fn index(&self, key: SlotKey<L>) -> &V {
        self.get(key)
    }
}

impl<V, L: KeyLayout> IndexMut<SlotKey<L>> for SparseSlotMap<V, L> {
    #[track_caller]
    fn index_mut(&mut self, key: SlotKey<L>) -> &mut V {
        self.get_mut(key)
    }
}

impl<'a, V, L: KeyLayout> IntoIterator for &'a SparseSlotMap<V, L> {
    type Item = (SlotKey<L>, &'a V);
    type IntoIter = Iter<'a, V, L>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, V, L: KeyLayout> IntoIterator for &'a mut SparseSlotMap<V, L> {
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
    map: &'a SparseSlotMap<V, L>,
    position: usize,
}

impl<'a, V, L: KeyLayout> Iterator for Iter<'a, V, L> {
    type Item = (SlotKey<L>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.map.dense_len {
            return None;
        }
        let position = self.position;
        self.position += 1;
        Some((self.map.key_at(position), self.map.dense_value(position)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.map.dense_len - self.position;
        (remaining, Some(remaining))
    }
}

impl<V, L: KeyLayout> ExactSizeIterator for Iter<'_, V, L> {}
impl<V, L: KeyLayout> FusedIterator for Iter<'_, V, L> {}

pub struct IterMut<'a, V, L: KeyLayout = Version32> {
    meta_pages: &'a [MetaPage<L>],
    layout: Layout,
    pages: slice::IterMut<'a, ValuePage<V>>,
    current: Option<Zip<slice::IterMut<'a, Option<V>>, slice::Iter<'a, u32>>>,
    remaining: usize,
}

impl<'a, V, L: KeyLayout> Iterator for IterMut<'a, V, L> {
    type Item = (SlotKey<L>, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            if let Some((value, &owner)) = self.current.as_mut().and_then(Iterator::next) {
                let value = value.as_mut()?;
                self.remaining -= 1;
                let (page, slot) = self.layout.address(owner);
                let meta = self.meta_pages[page].meta(slot);
                return Some((SlotKey::new(owner, meta.version()), value));
            }
            let page = self.pages.next()?;
            self.current = Some(page.values.iter_mut().zip(page.back_index.iter()));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V, L: KeyLayout> ExactSizeIterator for IterMut<'_, V, L> {}
impl<V, L: KeyLayout> FusedIterator for IterMut<'_, V, L> {}

pub struct Drain<'a, V, L: KeyLayout = Version32> {
    map: &'a mut SparseSlotMap<V, L>,
}

impl<V, L: KeyLayout> Iterator for Drain<'_, V, L> {
    type Item = (SlotKey<L>, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.map.dense_len == 0 {
            return None;
        }
        let key = self.map.key_at(self.map.dense_len - 1);
        self.map.try_remove(key).ok().map(|value| (key, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.map.dense_len, Some(self.map.dense_len))
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
impl<V, L: KeyLayout> SparseSlotMap<V, L> {
    pub(crate) fn assert_invariants(&self) {
        use crate::key::SlotState;
        use std::collections::HashSet;

        assert!(self.value_pages.len() <= self.meta_pages.len());
        assert!(self.next_index <= self.capacity() as u64);

        let mut occupied = 0;
        let mut tombstones = 0;
        for index in 0..self.next_index as u32 {
            let (page, slot) = self.layout.address(index);
            let meta = self.meta_pages[page].meta(slot);
            match meta.state() {
                SlotState::Occupied => {
                    occupied += 1;
                    let key = SlotKey::new(index, meta.version());
                    let position = self.position_of(key).expect("occupied slot resolves");
                    assert!(position < self.dense_len, "slot {index} points past dense end");
                    assert_eq!(self.back_index(position), index, "back link of slot {index}");
                }
                SlotState::Tombstone => tombstones += 1,
                SlotState::Empty => {}
            }
        }
        assert_eq!(occupied, self.dense_len, "dense_len out of sync");
        assert_eq!(tombstones, self.tombstone_count, "tombstone_count out of sync");

        let dense_capacity = self.value_pages.len() * self.layout.page_size as usize;
        for position in 0..dense_capacity {
            let (page, slot) = self.dense_address(position);
            let filled = self.value_pages[page].values[slot].is_some();
            assert_eq!(filled, position < self.dense_len, "dense gap at {position}");
        }

        let mut seen = HashSet::new();
        for key in &self.free_keys {
            assert!(seen.insert(key.index()), "index {} queued twice", key.index());
            let (page, slot) = self.layout.address(key.index());
            let meta = self.meta_pages[page].meta(slot);
            assert_eq!(meta.state(), SlotState::Empty);
            assert_eq!(meta.version(), key.version());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Version8;

    fn small<V>() -> SparseSlotMap<V> {
        SparseSlotMap::with_page_size(4, 0)
    }

    #[test]
    fn test_basic() {
        let mut map: SparseSlotMap<&str> = SparseSlotMap::new();
        let a = map.add("a");
        let b = map.add("b");
        assert_eq!(map.get(a), &"a");
        assert_eq!(map[b], "b");
        assert_eq!(map.len(), 2);
        map[a] = "A";
        assert_eq!(map.get_or_none(a), Some(&"A"));
        map.assert_invariants();
    }

    #[test]
    fn test_swap_remove_relinks_moved_value() {
        let mut map = small::<char>();
        let keys = map.add_all(['a', 'b', 'c', 'd', 'e']);
        assert_eq!(map.value_page_count(), 2);
        assert_eq!(map.dense_len(), 5);

        // 'e' fills the hole left by 'b'.
        assert_eq!(map.remove(keys[1]), Some('b'));
        map.assert_invariants();
        let dense: Vec<char> = map.values().copied().collect();
        assert_eq!(dense, vec!['a', 'e', 'c', 'd']);
        assert_eq!(map.get(keys[4]), &'e');
        assert_eq!(map.try_get(keys[1]), Err(SlotError::Empty));

        // Removing the last dense value needs no move.
        assert_eq!(map.remove(keys[3]), Some('d'));
        map.assert_invariants();
        assert_eq!(map.values().copied().collect::<Vec<_>>(), vec!['a', 'e', 'c']);

        for &key in &[keys[0], keys[2], keys[4]] {
            map.remove(key);
            map.assert_invariants();
        }
        assert!(map.is_empty());
    }

    #[test]
    fn test_scenario_reuse() {
        let mut map = small::<char>();
        let keys = map.add_all(['A', 'B', 'C', 'D']);
        assert_eq!(map.page_count(), 1);
        let e = map.add('E');
        assert_eq!(map.page_count(), 2);

        map.remove(keys[1]);
        assert_eq!(map.slot_count(), 4);
        assert_eq!(map.free_key_count(), 1);

        let f = map.add('F');
        assert_eq!(f.index(), keys[1].index());
        assert_eq!(f.version().get(), keys[1].version().get() + 1);
        assert_eq!(map.try_get(keys[1]), Err(SlotError::VersionMismatch));
        assert_eq!(map.get(f), &'F');
        assert_eq!(map.get(e), &'E');
        map.assert_invariants();
    }

    #[test]
    #[should_panic(expected = "version mismatch")]
    fn test_get_stale_key_panics() {
        let mut map = small();
        let k = map.add(1);
        map.remove(k);
        map.add(2);
        map.get(k);
    }

    #[test]
    fn test_replace_in_place() {
        let mut map = small::<u32>();
        let keys = map.add_all(0..3);
        let next = map.replace(keys[1], 10);
        assert_eq!(next.index(), keys[1].index());
        assert_eq!(map.get(next), &10);
        assert_eq!(map.try_get(keys[1]), Err(SlotError::VersionMismatch));
        assert_eq!(map.values().copied().collect::<Vec<_>>(), vec![0, 10, 2]);
        map.assert_invariants();
    }

    #[test]
    fn test_replace_until_exhausted_tombstones() {
        let mut map: SparseSlotMap<u32, Version8> = SparseSlotMap::with_page_size(4, 0);
        let other = map.add(100);
        let mut key = map.add(0);
        for i in 1..255u32 {
            key = map.replace(key, i);
        }
        assert!(key.version().is_max());

        let moved = map.replace(key, 255);
        assert_eq!(map.tombstone_count(), 1);
        assert_eq!(map.try_get(key), Err(SlotError::Tombstone));
        assert_eq!(map.get(moved), &255);
        assert_eq!(map.get(other), &100);
        assert_eq!(map.len(), 2);

        for _ in 0..10 {
            let k = map.add(0);
            assert_ne!(k.index(), key.index());
            map.remove(k);
        }
        map.assert_invariants();
    }

    #[test]
    fn test_capacity_bound() {
        let config = SlotMapConfig::new().with_page_size(2).with_max_page_count(2);
        let mut map: SparseSlotMap<u32> = SparseSlotMap::with_config(config);
        map.add_all(0..4);
        let rejected = map.try_add(4).unwrap_err();
        assert_eq!(rejected.error, SlotError::CapacityExhausted);
        assert_eq!(rejected.value, 4);
        assert_eq!(map.len(), 4);
        map.assert_invariants();
    }

    #[test]
    fn test_iteration() {
        let mut map = small::<u32>();
        let keys = map.add_all(0..6);
        map.remove(keys[0]);

        let got: Vec<(SlotKey, u32)> = map.iter().map(|(k, v)| (k, *v)).collect();
        assert_eq!(
            got,
            vec![(keys[5], 5), (keys[1], 1), (keys[2], 2), (keys[3], 3), (keys[4], 4)]
        );
        assert_eq!(map.iter().len(), 5);

        for (key, value) in &mut map {
            *value += key.index() * 100;
        }
        assert_eq!(map.get(keys[5]), &505);
        for value in map.values_mut() {
            *value %= 100;
        }
        assert_eq!(map.get(keys[3]), &3);
        assert!(map.keys().all(|k| map.contains(k)));
    }

    #[test]
    fn test_drain_and_clear() {
        let mut map = small::<u32>();
        let keys = map.add_all(0..5);
        let first: Vec<_> = map.drain().take(1).collect();
        assert_eq!(first, vec![(keys[4], 4)]);
        assert!(map.is_empty());
        assert!(keys.iter().all(|&key| !map.contains(key)));

        let again = map.add_all(0..3);
        map.clear();
        assert!(map.is_empty());
        assert!(again.iter().all(|&key| map.try_get(key).is_err()));
        map.assert_invariants();
    }

    #[test]
    fn test_reset() {
        let mut map = small::<u32>();
        map.add_all(0..10);
        map.reset();
        assert_eq!(map.page_count(), 1);
        assert_eq!(map.value_page_count(), 1);
        assert!(map.is_empty());
        map.reset_with_capacity(8);
        assert_eq!(map.page_count(), 2);
        map.add_all(0..8);
        assert_eq!(map.page_count(), 2);
        map.assert_invariants();
    }

    #[test]
    fn test_bulk_ranges() {
        let mut map = small::<u32>();
        let mut keys = [SlotKey::INVALID; 3];
        map.add_range(&[7, 8, 9], &mut keys);
        let mut values = [0; 3];
        map.get_range(&keys, &mut values);
        assert_eq!(values, [7, 8, 9]);

        let mut out = [None, None];
        assert!(matches!(
            map.try_remove_range(&keys, &mut out),
            Err(SlotError::BufferTooSmall { needed: 3, available: 2 })
        ));
        assert_eq!(map.remove_range(&keys[..2]), 2);
        assert_eq!(map.len(), 1);
        map.assert_invariants();
    }

    #[test]
    fn test_cursor_fails_fast() {
        let mut map = small::<u32>();
        let keys = map.add_all(0..4);
        let mut cursor = map.cursor();
        assert_eq!(map.advance(&mut cursor), Ok(Some((keys[0], &0))));

        // A swap-remove moves 3 in front of the cursor.
        map.remove(keys[1]);
        assert_eq!(map.advance(&mut cursor), Err(SlotError::Modified));
        assert_eq!(map.advance(&mut cursor), Err(SlotError::Modified));

        let mut cursor = map.cursor();
        let mut seen = 0;
        while map.advance(&mut cursor).unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_remove_stale_key_is_soft() {
        let mut map = small::<u32>();
        let keys = map.add_all(0..3);
        assert_eq!(map.remove(keys[0]), Some(0));

        let before = (map.len(), map.free_key_count(), map.tombstone_count());
        let dense: Vec<u32> = map.values().copied().collect();
        assert_eq!(map.remove(keys[0]), None);
        assert_eq!(map.remove(SlotKey::INVALID), None);
        assert_eq!((map.len(), map.free_key_count(), map.tombstone_count()), before);
        assert_eq!(map.values().copied().collect::<Vec<_>>(), dense);
        map.assert_invariants();
    }

    #[test]
    fn test_cursor_rejects_other_map() {
        let mut a = small::<u32>();
        let mut b = small::<u32>();
        a.add(10);
        b.add(20);
        let mut cursor = a.cursor();
        assert_eq!(b.advance(&mut cursor), Err(SlotError::Modified));
        assert!(cursor.is_invalidated());
    }

    #[test]
    fn test_tags_are_ignored_for_lookup() {
        let mut map: SparseSlotMap<u32, crate::key::Tagged30> = SparseSlotMap::new();
        let key = map.add(1).with_tag(2);
        assert!(map.contains(key));
        assert_eq!(map.remove(key), Some(1));
        assert!(!map.contains(key.with_tag(0)));
    }
}
