//! # Archetype Storage
//!
//! Groups with the same component-type set share one archetype: one
//! [`ChunkedPool`] per component type, all index-aligned, so a single
//! [`PoolHandle`] addresses a group's record in every column.
//!
//! ```text
//! Archetype {Identity, Position, Velocity}:
//!
//!            chunk 0            chunk 1
//! Identity:  [G0 G1 G2 G3]      [G4 G5 .. ..]
//! Position:  [P0 P1 P2 P3]      [P4 P5 .. ..]
//! Velocity:  [V0 V1 V2 V3]      [V4 V5 .. ..]
//! ```
//!
//! Every archetype also keeps a smaller set of graveyard pools with the same
//! columns. Disposed groups are copied there for one extra maintenance pass.
//!
//! ## Lockstep Invariant
//!
//! All live pools see the same sequence of `allocate`/`free` calls, so their
//! slot tables, generations and chunk occupancy stay identical. The same
//! holds for the graveyard pools.

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use super::component::{BufferLayout, ComponentRegistry, ComponentTypeId};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::{ChunkedPool, PoolHandle, PoolStats};

/// Archetype index, assigned in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// Returns the raw index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Sorted, deduplicated component-type set of an archetype.
///
/// Always contains [`ComponentTypeId::IDENTITY`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArchetypeSignature(Box<[ComponentTypeId]>);

impl ArchetypeSignature {
    /// Builds a signature from any ordering of types, adding the identity.
    #[must_use]
    pub fn new(types: &[ComponentTypeId]) -> Self {
        let mut sorted = Vec::with_capacity(types.len() + 1);
        sorted.push(ComponentTypeId::IDENTITY);
        sorted.extend_from_slice(types);
        sorted.sort_unstable();
        sorted.dedup();
        Self(sorted.into_boxed_slice())
    }

    /// Component types in ascending id order.
    #[inline]
    #[must_use]
    pub fn types(&self) -> &[ComponentTypeId] {
        &self.0
    }

    /// Column index of a type.
    #[inline]
    #[must_use]
    pub fn index_of(&self, ty: ComponentTypeId) -> Option<usize> {
        self.0.binary_search(&ty).ok()
    }

    /// Checks membership.
    #[inline]
    #[must_use]
    pub fn contains(&self, ty: ComponentTypeId) -> bool {
        self.index_of(ty).is_some()
    }

    /// Checks that every type in `types` is present.
    #[must_use]
    pub fn is_superset_of(&self, types: &[ComponentTypeId]) -> bool {
        types.iter().all(|&ty| self.contains(ty))
    }
}

/// Immutable per-column data copied from the registry.
#[derive(Debug)]
pub(crate) struct Column {
    pub(crate) type_id: ComponentTypeId,
    pub(crate) size: usize,
    pub(crate) default: Box<[u8]>,
    pub(crate) buffer: Option<BufferLayout>,
}

/// Pools of one archetype. Guarded by the archetype's storage lock.
pub(crate) struct ArchetypeStorage {
    live: Vec<ChunkedPool>,
    graveyard: Vec<ChunkedPool>,
}

impl ArchetypeStorage {
    fn pools(&self, disposed: bool) -> &[ChunkedPool] {
        if disposed {
            &self.graveyard
        } else {
            &self.live
        }
    }

    /// Allocates a live record in every column and writes the defaults.
    pub(crate) fn allocate(&mut self, columns: &[Column]) -> RuntimeResult<PoolHandle> {
        // Reserve everywhere first so a failure cannot desynchronize the pools.
        for pool in &mut self.live {
            pool.reserve()?;
        }
        let mut handle = PoolHandle::NULL;
        for (pool, column) in self.live.iter_mut().zip(columns) {
            let h = pool.allocate()?;
            debug_assert!(handle.is_null() || handle == h, "live pools out of lockstep");
            handle = h;
            pool.record_mut(h)?.copy_from_slice(&column.default);
        }
        Ok(handle)
    }

    /// Frees a live record in every column.
    pub(crate) fn free(&mut self, handle: PoolHandle) -> RuntimeResult<()> {
        for pool in &mut self.live {
            pool.free(handle)?;
        }
        Ok(())
    }

    /// Makes room in every graveyard pool for one more record.
    pub(crate) fn reserve_graveyard(&mut self) -> RuntimeResult<()> {
        for pool in &mut self.graveyard {
            pool.reserve()?;
        }
        Ok(())
    }

    /// Copies a live record into the graveyard and frees the live slot.
    pub(crate) fn bury(&mut self, handle: PoolHandle) -> RuntimeResult<PoolHandle> {
        self.reserve_graveyard()?;
        let mut buried = PoolHandle::NULL;
        for (live, grave) in self.live.iter_mut().zip(&mut self.graveyard) {
            let h = grave.allocate()?;
            debug_assert!(buried.is_null() || buried == h, "graveyard pools out of lockstep");
            buried = h;
            grave.record_mut(h)?.copy_from_slice(live.record(handle)?);
            live.free(handle)?;
        }
        Ok(buried)
    }

    /// Frees a graveyard record in every column.
    pub(crate) fn purge(&mut self, handle: PoolHandle) -> RuntimeResult<()> {
        for pool in &mut self.graveyard {
            pool.free(handle)?;
        }
        Ok(())
    }

    /// Bytes of one column of a record.
    pub(crate) fn record(
        &self,
        disposed: bool,
        column: usize,
        handle: PoolHandle,
    ) -> RuntimeResult<&[u8]> {
        self.pools(disposed)[column].record(handle)
    }

    /// Bytes of one column of a live record, for writing.
    pub(crate) fn record_mut(&mut self, column: usize, handle: PoolHandle) -> RuntimeResult<&mut [u8]> {
        self.live[column].record_mut(handle)
    }

    /// Active chunks; identical for every column.
    pub(crate) fn chunk_count(&self, disposed: bool) -> usize {
        self.pools(disposed)[0].active_chunk_count()
    }

    /// Base pointer and record count of one column of one chunk.
    pub(crate) fn chunk_column(
        &self,
        disposed: bool,
        column: usize,
        chunk: usize,
    ) -> Option<(NonNull<u8>, usize)> {
        self.pools(disposed)[column].chunk_records(chunk)
    }
}

/// An archetype and its pools.
pub struct Archetype {
    id: ArchetypeId,
    signature: ArchetypeSignature,
    columns: Box<[Column]>,
    storage: Mutex<ArchetypeStorage>,
}

impl Archetype {
    /// Creates an archetype with empty pools.
    ///
    /// # Errors
    ///
    /// `UnknownComponent` if a type is not registered, `InvalidConfig` if a
    /// pool cannot be laid out.
    pub(crate) fn new(
        id: u32,
        signature: ArchetypeSignature,
        registry: &ComponentRegistry,
        config: &RuntimeConfig,
    ) -> RuntimeResult<Self> {
        let mut columns = Vec::with_capacity(signature.types().len());
        let mut live = Vec::with_capacity(signature.types().len());
        let mut graveyard = Vec::with_capacity(signature.types().len());

        for &ty in signature.types() {
            let descriptor = registry.get(ty)?;
            live.push(ChunkedPool::new(
                descriptor.size(),
                descriptor.align(),
                config.chunk_capacity,
                config.reserved_empty_chunks,
                config.max_chunks_per_pool,
            )?);
            graveyard.push(ChunkedPool::new(
                descriptor.size(),
                descriptor.align(),
                config.graveyard_chunk_capacity,
                config.reserved_empty_chunks,
                config.max_chunks_per_pool,
            )?);
            columns.push(Column {
                type_id: ty,
                size: descriptor.size(),
                default: descriptor.default_bytes().into(),
                buffer: descriptor.buffer(),
            });
        }

        Ok(Self {
            id: ArchetypeId(id),
            signature,
            columns: columns.into_boxed_slice(),
            storage: Mutex::new(ArchetypeStorage { live, graveyard }),
        })
    }

    /// Returns the archetype id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Returns the component-type set.
    #[inline]
    #[must_use]
    pub fn signature(&self) -> &ArchetypeSignature {
        &self.signature
    }

    /// Live groups in this archetype.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.lock().live[0].len()
    }

    /// Checks if no live group uses this archetype.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active chunks in the live (`disposed = false`) or graveyard pools.
    #[must_use]
    pub fn chunk_count(&self, disposed: bool) -> usize {
        self.storage.lock().chunk_count(disposed)
    }

    /// Occupancy of one column's pool. All columns report the same counts.
    #[must_use]
    pub fn pool_stats(&self, disposed: bool) -> PoolStats {
        self.storage.lock().pools(disposed)[0].stats()
    }

    /// Changes the empty-chunk reservation of every pool.
    pub fn set_reserved_empty_chunks(&self, count: usize) {
        let mut storage = self.storage.lock();
        let ArchetypeStorage { live, graveyard } = &mut *storage;
        for pool in live.iter_mut().chain(graveyard.iter_mut()) {
            pool.set_reserved_empty_chunks(count);
        }
    }

    pub(crate) fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column index of a type, or `MissingColumn`.
    pub(crate) fn column_index(&self, ty: ComponentTypeId) -> RuntimeResult<usize> {
        self.signature
            .index_of(ty)
            .ok_or(RuntimeError::MissingColumn(ty))
    }

    pub(crate) fn storage(&self) -> MutexGuard<'_, ArchetypeStorage> {
        self.storage.lock()
    }
}

impl std::fmt::Debug for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::Component;
    use crate::ecs::GroupId;
    use bytemuck::{Pod, Zeroable};

    #[allow(dead_code)]
    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health(u32);

    impl Default for Health {
        fn default() -> Self {
            Self(100)
        }
    }

    impl Component for Health {
        const ID: ComponentTypeId = ComponentTypeId::new(3);
        const NAME: &'static str = "Health";
    }

    fn archetype(chunk_capacity: usize) -> Archetype {
        let registry = ComponentRegistry::builder()
            .register::<Health>()
            .unwrap()
            .build();
        let config = RuntimeConfig {
            chunk_capacity,
            graveyard_chunk_capacity: 2,
            ..RuntimeConfig::default()
        };
        Archetype::new(0, ArchetypeSignature::new(&[Health::ID]), &registry, &config).unwrap()
    }

    #[test]
    fn test_signature_is_order_independent() {
        let a = ArchetypeSignature::new(&[ComponentTypeId::new(5), ComponentTypeId::new(2)]);
        let b = ArchetypeSignature::new(&[
            ComponentTypeId::new(2),
            ComponentTypeId::new(5),
            ComponentTypeId::new(2),
        ]);
        assert_eq!(a, b);
        assert_eq!(a.types()[0], ComponentTypeId::IDENTITY);
        assert!(a.is_superset_of(&[ComponentTypeId::new(5)]));
        assert!(!a.is_superset_of(&[ComponentTypeId::new(7)]));
    }

    #[test]
    fn test_allocate_writes_defaults() {
        let arch = archetype(4);
        let h = arch.storage().allocate(arch.columns()).unwrap();
        let health = arch.column_index(Health::ID).unwrap();

        let storage = arch.storage();
        assert_eq!(storage.record(false, health, h).unwrap(), &100u32.to_ne_bytes());
        let identity: GroupId = bytemuck::pod_read_unaligned(storage.record(false, 0, h).unwrap());
        assert!(identity.is_null());
    }

    #[test]
    fn test_columns_stay_aligned_across_chunks() {
        let arch = archetype(2);
        let handles: Vec<PoolHandle> = (0..5)
            .map(|_| arch.storage().allocate(arch.columns()).unwrap())
            .collect();
        assert_eq!(arch.chunk_count(false), 3);

        arch.storage().free(handles[1]).unwrap();
        let storage = arch.storage();
        for chunk in 0..storage.chunk_count(false) {
            let (_, ids) = storage.chunk_column(false, 0, chunk).unwrap();
            let (_, hp) = storage.chunk_column(false, 1, chunk).unwrap();
            assert_eq!(ids, hp);
        }
    }

    #[test]
    fn test_bury_and_purge() {
        let arch = archetype(4);
        let h = arch.storage().allocate(arch.columns()).unwrap();
        let health = arch.column_index(Health::ID).unwrap();
        arch.storage()
            .record_mut(health, h)
            .unwrap()
            .copy_from_slice(&7u32.to_ne_bytes());

        let grave = arch.storage().bury(h).unwrap();
        assert!(arch.is_empty());
        assert_eq!(arch.chunk_count(true), 1);
        assert_eq!(
            arch.storage().record(true, health, grave).unwrap(),
            &7u32.to_ne_bytes()
        );

        arch.storage().purge(grave).unwrap();
        assert_eq!(arch.chunk_count(true), 0);
        assert!(arch.storage().record(true, health, grave).is_err());
    }

    #[test]
    fn test_missing_column() {
        let arch = archetype(4);
        assert_eq!(
            arch.column_index(ComponentTypeId::new(99)),
            Err(RuntimeError::MissingColumn(ComponentTypeId::new(99)))
        );
    }
}
