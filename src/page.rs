//! Fixed-capacity block of slots.
//!
//! A page never grows; containers add capacity by appending pages, so
//! growth copies a page table instead of every stored value.

use std::iter::{Enumerate, Zip};
use std::slice;

use crate::error::{Rejected, SlotError};
use crate::key::{KeyLayout, SlotKey, SlotMeta, SlotState};

/// What a removal did to the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Retirement {
    /// Slot is empty and its key may be reissued with the next version.
    Recycle,
    /// Version exhausted; the slot is permanently dead.
    Tombstone,
}

pub(crate) struct Page<V, L: KeyLayout> {
    metas: Box<[SlotMeta<L>]>,
    values: Box<[Option<V>]>,
}

impl<V, L: KeyLayout> Page<V, L> {
    pub(crate) fn new(page_size: u32) -> Self {
        let len = page_size as usize;
        Self {
            metas: vec![SlotMeta::EMPTY; len].into_boxed_slice(),
            values: std::iter::repeat_with(|| None).take(len).collect(),
        }
    }

    #[inline]
    fn check(&self, slot: usize, key: SlotKey<L>) -> Result<(), SlotError> {
        let meta = self.metas[slot];
        match meta.state() {
            SlotState::Tombstone => Err(SlotError::Tombstone),
            SlotState::Empty => Err(SlotError::Empty),
            SlotState::Occupied if meta.version() != key.version() => {
                Err(SlotError::VersionMismatch)
            }
            SlotState::Occupied => Ok(()),
        }
    }

    #[inline]
    pub(crate) fn meta(&self, slot: usize) -> SlotMeta<L> {
        self.metas[slot]
    }

    pub(crate) fn contains(&self, slot: usize, key: SlotKey<L>) -> bool {
        self.check(slot, key).is_ok()
    }

    pub(crate) fn get(&self, slot: usize, key: SlotKey<L>) -> Result<&V, SlotError> {
        self.check(slot, key)?;
        Ok(self.values[slot]
            .as_ref()
            .expect("occupied slot must hold a value"))
    }

    pub(crate) fn get_mut(&mut self, slot: usize, key: SlotKey<L>) -> Result<&mut V, SlotError> {
        self.check(slot, key)?;
        Ok(self.values[slot]
            .as_mut()
            .expect("occupied slot must hold a value"))
    }

    /// Value of an occupied slot, without a version check.
    #[inline]
    pub(crate) fn value_mut(&mut self, slot: usize) -> Option<&mut V> {
        self.values[slot].as_mut()
    }

    /// Stores `value` under `key`. The slot must be empty and its last
    /// version older than the key's.
    pub(crate) fn add(&mut self, slot: usize, key: SlotKey<L>, value: V) -> Result<(), Rejected<V>> {
        let meta = self.metas[slot];
        let error = match meta.state() {
            SlotState::Tombstone => Some(SlotError::Tombstone),
            SlotState::Occupied => Some(SlotError::Occupied),
            SlotState::Empty if meta.version() >= key.version() => Some(SlotError::VersionMismatch),
            SlotState::Empty => None,
        };
        if let Some(error) = error {
            return Err(Rejected::new(error, value));
        }

        self.metas[slot] = SlotMeta::occupied(key.version());
        self.values[slot] = Some(value);
        Ok(())
    }

    /// Overwrites the value and bumps the version. Returns the new key and
    /// the previous value.
    pub(crate) fn replace(
        &mut self,
        slot: usize,
        key: SlotKey<L>,
        value: V,
    ) -> Result<(SlotKey<L>, V), Rejected<V>> {
        if let Err(error) = self.check(slot, key) {
            return Err(Rejected::new(error, value));
        }
        let version = self.metas[slot].version();
        if version.is_max() {
            return Err(Rejected::new(SlotError::VersionExhausted, value));
        }

        let next = version.next();
        self.metas[slot] = SlotMeta::occupied(next);
        let old = self.values[slot]
            .replace(value)
            .expect("occupied slot must hold a value");
        Ok((key.with_version(next), old))
    }

    /// Empties the slot, or tombstones it if its version is exhausted.
    pub(crate) fn remove(&mut self, slot: usize, key: SlotKey<L>) -> Result<(V, Retirement), SlotError> {
        self.check(slot, key)?;
        let version = self.metas[slot].version();
        let value = self.values[slot]
            .take()
            .expect("occupied slot must hold a value");

        if version.is_max() {
            self.metas[slot] = SlotMeta::tombstone(version);
            Ok((value, Retirement::Tombstone))
        } else {
            self.metas[slot] = SlotMeta::empty(version);
            Ok((value, Retirement::Recycle))
        }
    }

    pub(crate) fn iter(&self, base: u32) -> PageIter<'_, V, L> {
        PageIter {
            base,
            slots: self.metas.iter().zip(self.values.iter()).enumerate(),
        }
    }

    pub(crate) fn iter_mut(&mut self, base: u32) -> PageIterMut<'_, V, L> {
        PageIterMut {
            base,
            slots: self.metas.iter().zip(self.values.iter_mut()).enumerate(),
        }
    }
}

impl<V: Clone, L: KeyLayout> Clone for Page<V, L> {
    fn clone(&self) -> Self {
        Self {
            metas: self.metas.clone(),
            values: self.values.clone(),
        }
    }
}

pub(crate) struct PageIter<'a, V, L: KeyLayout> {
    base: u32,
    slots: Enumerate<Zip<slice::Iter<'a, SlotMeta<L>>, slice::Iter<'a, Option<V>>>>,
}

impl<'a, V, L: KeyLayout> Iterator for PageIter<'a, V, L> {
    type Item = (SlotKey<L>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        for (slot, (meta, value)) in self.slots.by_ref() {
            if let (true, Some(value)) = (meta.is_occupied(), value.as_ref()) {
                return Some((SlotKey::new(self.base + slot as u32, meta.version()), value));
            }
        }
        None
    }
}

pub(crate) struct PageIterMut<'a, V, L: KeyLayout> {
    base: u32,
    slots: Enumerate<Zip<slice::Iter<'a, SlotMeta<L>>, slice::IterMut<'a, Option<V>>>>,
}

impl<'a, V, L: KeyLayout> Iterator for PageIterMut<'a, V, L> {
    type Item = (SlotKey<L>, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        for (slot, (meta, value)) in self.slots.by_ref() {
            if let (true, Some(value)) = (meta.is_occupied(), value.as_mut()) {
                return Some((SlotKey::new(self.base + slot as u32, meta.version()), value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{SlotVersion, Version8};

    fn key(index: u32, version: u32) -> SlotKey<Version8> {
        SlotKey::new(index, SlotVersion::new(version))
    }

    #[test]
    fn test_add_get_remove() {
        let mut page: Page<&str, Version8> = Page::new(4);
        let k = key(2, 1);
        assert_eq!(page.get(2, k).unwrap_err(), SlotError::Empty);

        page.add(2, k, "a").unwrap();
        assert_eq!(page.get(2, k), Ok(&"a"));
        assert!(page.contains(2, k));
        assert!(!page.contains(2, key(2, 2)));
        assert_eq!(page.get(2, key(2, 2)).unwrap_err(), SlotError::VersionMismatch);

        assert_eq!(page.remove(2, k), Ok(("a", Retirement::Recycle)));
        assert_eq!(page.get(2, k).unwrap_err(), SlotError::Empty);
        assert_eq!(page.remove(2, k).unwrap_err(), SlotError::Empty);
    }

    #[test]
    fn test_add_requires_newer_version() {
        let mut page: Page<u8, Version8> = Page::new(4);
        page.add(0, key(0, 3), 1).unwrap();
        assert_eq!(page.add(0, key(0, 4), 2).unwrap_err().error, SlotError::Occupied);
        page.remove(0, key(0, 3)).unwrap();

        let rejected = page.add(0, key(0, 3), 9).unwrap_err();
        assert_eq!(rejected.error, SlotError::VersionMismatch);
        assert_eq!(rejected.value, 9);
        page.add(0, key(0, 4), 2).unwrap();
        assert_eq!(page.get(0, key(0, 4)), Ok(&2));
    }

    #[test]
    fn test_replace_bumps_version() {
        let mut page: Page<u8, Version8> = Page::new(2);
        page.add(1, key(1, 1), 10).unwrap();
        let (k2, old) = page.replace(1, key(1, 1), 20).unwrap();
        assert_eq!(old, 10);
        assert_eq!(k2.version().get(), 2);
        assert_eq!(page.get(1, k2), Ok(&20));
        assert_eq!(page.get(1, key(1, 1)).unwrap_err(), SlotError::VersionMismatch);
        assert_eq!(
            page.replace(1, key(1, 1), 30).unwrap_err().error,
            SlotError::VersionMismatch
        );
    }

    #[test]
    fn test_exhausted_version() {
        let mut page: Page<u8, Version8> = Page::new(2);
        let max = SlotKey::new(0, SlotVersion::MAX);
        page.add(0, max, 1).unwrap();

        let rejected = page.replace(0, max, 2).unwrap_err();
        assert_eq!(rejected.error, SlotError::VersionExhausted);
        assert_eq!(rejected.value, 2);
        assert_eq!(page.get(0, max), Ok(&1));

        assert_eq!(page.remove(0, max), Ok((1, Retirement::Tombstone)));
        assert_eq!(page.get(0, max).unwrap_err(), SlotError::Tombstone);
        assert_eq!(page.add(0, max, 3).unwrap_err().error, SlotError::Tombstone);
        assert_eq!(page.meta(0).state(), SlotState::Tombstone);
    }

    #[test]
    fn test_iter_skips_vacant() {
        let mut page: Page<u8, Version8> = Page::new(4);
        page.add(1, key(9, 1), 1).unwrap();
        page.add(3, key(11, 2), 3).unwrap();

        let got: Vec<_> = page.iter(8).map(|(k, v)| (k.index(), k.version().get(), *v)).collect();
        assert_eq!(got, vec![(9, 1, 1), (11, 2, 3)]);

        for (_, v) in page.iter_mut(8) {
            *v += 1;
        }
        assert_eq!(page.get(3, key(11, 2)), Ok(&4));
    }
}
