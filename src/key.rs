//! Key encoding: versions, per-slot metadata and packed handles.
//!
//! Everything here is a plain value transform over an integer. The width of
//! the version counter (and of the optional user tag) is picked at compile
//! time through a [`KeyLayout`].

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

// =============================================================================
// Layouts
// =============================================================================

/// Compile-time description of how a [`SlotKey`] spends its upper 32 bits.
///
/// The low 32 bits of every key are the slot index. The remaining bits hold
/// the version (`VERSION_BITS`, `1..=32`) followed by a user tag
/// (`TAG_BITS`, `0..=16`). Define new layouts with [`key_layout!`].
pub trait KeyLayout:
    Copy + Eq + Ord + Hash + fmt::Debug + Default + Send + Sync + 'static
{
    const VERSION_BITS: u32;
    const TAG_BITS: u32;
}

/// Declares a zero-sized [`KeyLayout`] type.
///
/// ```rust
/// paged_slotmap::key_layout! {
///     /// 12-bit versions, 4-bit tag.
///     pub struct Small { version_bits: 12, tag_bits: 4 }
/// }
///
/// use paged_slotmap::{KeyLayout, SlotVersion};
/// assert_eq!(Small::VERSION_BITS, 12);
/// assert_eq!(SlotVersion::<Small>::MAX.get(), 4095);
/// ```
#[macro_export]
macro_rules! key_layout {
    ($(#[$meta:meta])* $vis:vis struct $name:ident { version_bits: $v:expr, tag_bits: $t:expr $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
        $vis struct $name;

        impl $crate::KeyLayout for $name {
            const VERSION_BITS: u32 = $v;
            const TAG_BITS: u32 = $t;
        }

        const _: () = assert!(
            ($v) >= 1 && ($v) <= 32 && ($t) <= 16 && ($v) + ($t) <= 32,
            "key layout must fit version and tag into 32 bits"
        );
    };
}

key_layout! {
    /// 8-bit versions. Slots tombstone after 255 generations.
    pub struct Version8 { version_bits: 8, tag_bits: 0 }
}

key_layout! {
    /// 16-bit versions.
    pub struct Version16 { version_bits: 16, tag_bits: 0 }
}

key_layout! {
    /// Full 32-bit versions. The default layout.
    pub struct Version32 { version_bits: 32, tag_bits: 0 }
}

key_layout! {
    /// 16-bit versions plus a 16-bit user tag.
    pub struct Tagged16 { version_bits: 16, tag_bits: 16 }
}

key_layout! {
    /// 30-bit versions plus a 2-bit user tag.
    pub struct Tagged30 { version_bits: 30, tag_bits: 2 }
}

#[inline]
const fn low_mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// =============================================================================
// SlotVersion
// =============================================================================

/// Per-slot generation counter. `0` is reserved as [`SlotVersion::INVALID`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotVersion<L: KeyLayout = Version32> {
    raw: u32,
    _layout: PhantomData<L>,
}

impl<L: KeyLayout> SlotVersion<L> {
    pub const INVALID: Self = Self::from_raw(0);
    pub const MIN: Self = Self::from_raw(1);
    pub const MAX: Self = Self::from_raw(low_mask(L::VERSION_BITS) as u32);

    #[inline]
    const fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            _layout: PhantomData,
        }
    }

    /// Builds a version, clamping values above [`SlotVersion::MAX`].
    ///
    /// Panics on `0`.
    #[track_caller]
    pub fn new(raw: u32) -> Self {
        assert!(raw != 0, "slot version 0 is reserved as invalid");
        Self::from_raw(raw.min(Self::MAX.raw))
    }

    /// Like [`SlotVersion::new`], but returns `None` for `0`.
    pub fn try_new(raw: u32) -> Option<Self> {
        (raw != 0).then(|| Self::from_raw(raw.min(Self::MAX.raw)))
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.raw
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.raw != 0
    }

    #[inline]
    pub fn is_max(self) -> bool {
        self.raw >= Self::MAX.raw
    }

    /// The following version, saturating at [`SlotVersion::MAX`].
    ///
    /// Callers check [`SlotVersion::is_max`] first; a saturated increment
    /// means the slot has to be retired.
    #[inline]
    pub fn next(self) -> Self {
        if self.is_max() {
            self
        } else {
            Self::from_raw(self.raw + 1)
        }
    }
}

impl<L: KeyLayout> Default for SlotVersion<L> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<L: KeyLayout> fmt::Debug for SlotVersion<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.raw)
    }
}

impl<L: KeyLayout> fmt::Display for SlotVersion<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.raw, f)
    }
}

// =============================================================================
// SlotMeta
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Empty,
    Occupied,
    Tombstone,
}

/// Version and lifecycle state of one slot, packed into a `u64`.
///
/// Layout: bits 0..32 version, bits 32..34 state.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotMeta<L: KeyLayout> {
    raw: u64,
    _layout: PhantomData<L>,
}

impl<L: KeyLayout> SlotMeta<L> {
    const STATE_SHIFT: u32 = 32;
    const STATE_OCCUPIED: u64 = 1;
    const STATE_TOMBSTONE: u64 = 2;

    /// A never-used slot (version 0).
    pub(crate) const EMPTY: Self = Self {
        raw: 0,
        _layout: PhantomData,
    };

    #[inline]
    fn pack(version: SlotVersion<L>, state: u64) -> Self {
        Self {
            raw: version.get() as u64 | (state << Self::STATE_SHIFT),
            _layout: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn empty(version: SlotVersion<L>) -> Self {
        Self::pack(version, 0)
    }

    #[inline]
    pub(crate) fn occupied(version: SlotVersion<L>) -> Self {
        Self::pack(version, Self::STATE_OCCUPIED)
    }

    #[inline]
    pub(crate) fn tombstone(version: SlotVersion<L>) -> Self {
        Self::pack(version, Self::STATE_TOMBSTONE)
    }

    #[inline]
    pub(crate) fn version(self) -> SlotVersion<L> {
        SlotVersion::from_raw(self.raw as u32)
    }

    #[inline]
    pub(crate) fn state(self) -> SlotState {
        match self.raw >> Self::STATE_SHIFT {
            Self::STATE_OCCUPIED => SlotState::Occupied,
            Self::STATE_TOMBSTONE => SlotState::Tombstone,
            _ => SlotState::Empty,
        }
    }

    #[inline]
    pub(crate) fn is_occupied(self) -> bool {
        self.state() == SlotState::Occupied
    }
}

impl<L: KeyLayout> fmt::Debug for SlotMeta<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?})", self.state(), self.version())
    }
}

// =============================================================================
// SlotKey
// =============================================================================

/// Opaque handle to a value stored in a slot map.
///
/// Packs `index:32 | version:L::VERSION_BITS | tag:L::TAG_BITS` into one
/// `u64`. A key is valid iff its version is non-zero. The raw word is only
/// meaningful to the container instance that produced it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey<L: KeyLayout = Version32> {
    raw: u64,
    _layout: PhantomData<L>,
}

impl<L: KeyLayout> SlotKey<L> {
    const VERSION_SHIFT: u32 = 32;
    const TAG_SHIFT: u32 = 32 + L::VERSION_BITS;
    const VERSION_MASK: u64 = low_mask(L::VERSION_BITS);
    const TAG_MASK: u64 = low_mask(L::TAG_BITS);
    const USED_MASK: u64 = low_mask(32 + L::VERSION_BITS + L::TAG_BITS);

    pub const INVALID: Self = Self {
        raw: 0,
        _layout: PhantomData,
    };

    #[inline]
    pub(crate) fn new(index: u32, version: SlotVersion<L>) -> Self {
        Self {
            raw: index as u64 | ((version.get() as u64) << Self::VERSION_SHIFT),
            _layout: PhantomData,
        }
    }

    /// Rebuilds a key from [`SlotKey::to_raw`]. Bits outside the layout are
    /// dropped.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            raw: raw & Self::USED_MASK,
            _layout: PhantomData,
        }
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.raw as u32
    }

    #[inline]
    pub fn version(self) -> SlotVersion<L> {
        SlotVersion::from_raw(((self.raw >> Self::VERSION_SHIFT) & Self::VERSION_MASK) as u32)
    }

    #[inline]
    pub fn tag(self) -> u16 {
        (self.raw.checked_shr(Self::TAG_SHIFT).unwrap_or(0) & Self::TAG_MASK) as u16
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.version().is_valid()
    }

    /// Copy of this key carrying `tag`. Returns `None` if the tag does not
    /// fit the layout's tag bits.
    pub fn try_with_tag(self, tag: u16) -> Option<Self> {
        let tag = tag as u64;
        if tag & !Self::TAG_MASK != 0 {
            return None;
        }
        let cleared = self.raw & !(Self::TAG_MASK.checked_shl(Self::TAG_SHIFT).unwrap_or(0));
        Some(Self {
            raw: cleared | tag.checked_shl(Self::TAG_SHIFT).unwrap_or(0),
            _layout: PhantomData,
        })
    }

    /// Copy of this key carrying `tag`. Panics if the tag does not fit.
    #[track_caller]
    pub fn with_tag(self, tag: u16) -> Self {
        match self.try_with_tag(tag) {
            Some(key) => key,
            None => panic!(
                "tag {tag} does not fit in {} tag bits",
                L::TAG_BITS
            ),
        }
    }

    /// Same index and tag, new version.
    #[inline]
    pub(crate) fn with_version(self, version: SlotVersion<L>) -> Self {
        let cleared = self.raw & !(Self::VERSION_MASK << Self::VERSION_SHIFT);
        Self {
            raw: cleared | ((version.get() as u64) << Self::VERSION_SHIFT),
            _layout: PhantomData,
        }
    }

    /// The key a retired slot is reissued under: next version, no tag.
    #[inline]
    pub(crate) fn recycled(self) -> Self {
        Self::new(self.index(), self.version().next())
    }
}

impl<L: KeyLayout> Default for SlotKey<L> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<L: KeyLayout> From<SlotKey<L>> for u64 {
    fn from(key: SlotKey<L>) -> Self {
        key.to_raw()
    }
}

impl<L: KeyLayout> fmt::Debug for SlotKey<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if L::TAG_BITS == 0 {
            write!(f, "SlotKey({}v{})", self.index(), self.version().get())
        } else {
            write!(
                f,
                "SlotKey({}v{}#{})",
                self.index(),
                self.version().get(),
                self.tag()
            )
        }
    }
}

impl<L: KeyLayout> fmt::Display for SlotKey<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index(), self.version().get())
    }
}
