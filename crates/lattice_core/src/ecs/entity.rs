//! # Component Groups
//!
//! A component group (entity) is identified by a 64-bit id that is never
//! reused. The id doubles as the implicit identity component every group
//! carries, so chunk views can report which group owns each row.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use super::component::{Component, ComponentTypeId};

/// Unique identifier for a component group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct GroupId(u64);

impl GroupId {
    /// Null/invalid group id.
    pub const NULL: Self = Self(u64::MAX);

    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Checks if this group id is null/invalid.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::NULL
    }
}

impl Component for GroupId {
    const ID: ComponentTypeId = ComponentTypeId::IDENTITY;
    const NAME: &'static str = "Identity";
}

/// Thread-safe source of fresh group ids.
#[derive(Debug)]
pub(crate) struct GroupIdAllocator {
    next: AtomicU64,
}

impl GroupIdAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> GroupId {
        GroupId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_roundtrip() {
        let id = GroupId::from_raw(12345);
        assert_eq!(id.raw(), 12345);
        assert!(!id.is_null());
        assert!(GroupId::default().is_null());
    }

    #[test]
    fn test_allocator_is_unique_across_threads() {
        let allocator = GroupIdAllocator::new();
        let mut ids: Vec<GroupId> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..1000).map(|_| allocator.next()).collect::<Vec<_>>()))
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4000);
    }
}
