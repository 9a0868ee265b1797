//! Soft failures reported by the `try_*` API family.
//!
//! The panicking methods report the same errors, as panic messages.

use std::fmt;

/// Why a slot map operation did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotError {
    /// The key carries the invalid (zero) version.
    InvalidKey,
    /// The key's index was never handed out by this container.
    OutOfRange,
    /// The slot holds no value.
    Empty,
    /// The slot was permanently retired after exhausting its version.
    Tombstone,
    /// The slot already holds a value.
    Occupied,
    /// The slot holds a value under a different version (stale key).
    VersionMismatch,
    /// The slot's version is at its maximum and cannot be bumped.
    VersionExhausted,
    /// Every representable page is allocated and full.
    CapacityExhausted,
    /// An output buffer cannot hold the results.
    BufferTooSmall { needed: usize, available: usize },
    /// The container changed since the cursor was created.
    Modified,
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SlotError::InvalidKey => f.write_str("invalid key"),
            SlotError::OutOfRange => f.write_str("key index out of range"),
            SlotError::Empty => f.write_str("empty slot"),
            SlotError::Tombstone => f.write_str("dead slot"),
            SlotError::Occupied => f.write_str("slot already occupied"),
            SlotError::VersionMismatch => f.write_str("version mismatch"),
            SlotError::VersionExhausted => f.write_str("cannot replace: version exhausted"),
            SlotError::CapacityExhausted => f.write_str("slot map capacity exhausted"),
            SlotError::BufferTooSmall { needed, available } => write!(
                f,
                "buffer too small: needed {needed}, available {available}"
            ),
            SlotError::Modified => f.write_str("collection was modified during iteration"),
        }
    }
}

impl std::error::Error for SlotError {}

/// A failed `try_add`/`try_replace`, handing the value back to the caller.
pub struct Rejected<V> {
    pub error: SlotError,
    pub value: V,
}

impl<V> Rejected<V> {
    #[inline]
    pub(crate) fn new(error: SlotError, value: V) -> Self {
        Self { error, value }
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

impl<V> fmt::Debug for Rejected<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<V> fmt::Display for Rejected<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<V> std::error::Error for Rejected<V> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<V> From<Rejected<V>> for SlotError {
    fn from(rejected: Rejected<V>) -> Self {
        rejected.error
    }
}

/// Invalid construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    PageSizeNotPowerOfTwo(u32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ConfigError::PageSizeNotPowerOfTwo(size) => {
                write!(f, "page size must be a non-zero power of two, got {size}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Hard failure: report `error` for `context` and abort the operation.
#[cold]
#[track_caller]
pub(crate) fn hard_fail(error: impl fmt::Display, context: impl fmt::Debug) -> ! {
    panic!("{error}: {context:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(SlotError::Tombstone.to_string(), "dead slot");
        assert_eq!(SlotError::Empty.to_string(), "empty slot");
        assert_eq!(
            SlotError::BufferTooSmall {
                needed: 4,
                available: 2
            }
            .to_string(),
            "buffer too small: needed 4, available 2"
        );
        assert_eq!(
            ConfigError::PageSizeNotPowerOfTwo(3).to_string(),
            "page size must be a non-zero power of two, got 3"
        );
    }

    #[test]
    fn test_rejected_returns_value() {
        let rejected = Rejected::new(SlotError::CapacityExhausted, String::from("payload"));
        assert_eq!(rejected.to_string(), "slot map capacity exhausted");
        assert_eq!(format!("{rejected:?}"), "Rejected { error: CapacityExhausted, .. }");
        assert_eq!(rejected.into_value(), "payload");
    }
}
