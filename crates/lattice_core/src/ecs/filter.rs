//! # Filtering Index
//!
//! A filtering group is a named, ordered list of component types. It
//! resolves to every archetype whose signature is a superset of the list.
//!
//! Resolutions are keyed by the *unordered* set, so `[Position, Velocity]`
//! and `[Velocity, Position]` share one archetype list. New archetypes are
//! pushed into every matching resolution when they are created, so a
//! filter registered before its first archetype exists picks it up later.

// SAFETY: Chunk views expose raw column memory as typed slices.
// All unsafe blocks are documented at the point of use.
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;

use super::archetype::{Archetype, ArchetypeId};
use super::component::{Component, ComponentTypeId};
use super::entity::GroupId;
use crate::error::{RuntimeError, RuntimeResult};

/// Identifier of a registered filtering group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FilterId(u32);

impl FilterId {
    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct Filter {
    name: String,
    types: Vec<ComponentTypeId>,
    resolution: usize,
}

#[derive(Debug)]
struct Resolution {
    set: Vec<ComponentTypeId>,
    archetypes: Vec<Arc<Archetype>>,
}

/// Filters and their archetype resolutions.
#[derive(Debug, Default)]
pub(crate) struct FilteringIndex {
    filters: Vec<Filter>,
    by_name: HashMap<String, FilterId>,
    resolutions: Vec<Resolution>,
    by_set: HashMap<Vec<ComponentTypeId>, usize>,
}

impl FilteringIndex {
    /// Registers a filter, resolving it against the existing archetypes.
    ///
    /// Re-registering a name with the same list returns the existing id.
    pub(crate) fn register<'a>(
        &mut self,
        name: &str,
        types: &[ComponentTypeId],
        archetypes: impl Iterator<Item = &'a Arc<Archetype>>,
    ) -> RuntimeResult<FilterId> {
        if let Some(&id) = self.by_name.get(name) {
            let existing = &self.filters[id.0 as usize];
            if existing.types == types {
                return Ok(id);
            }
            return Err(RuntimeError::FilterConflict(name.to_string()));
        }

        let mut set = types.to_vec();
        set.sort_unstable();
        set.dedup();

        let resolution = match self.by_set.get(&set) {
            Some(&index) => index,
            None => {
                let matching = archetypes
                    .filter(|a| a.signature().is_superset_of(&set))
                    .cloned()
                    .collect();
                self.resolutions.push(Resolution {
                    set: set.clone(),
                    archetypes: matching,
                });
                let index = self.resolutions.len() - 1;
                self.by_set.insert(set, index);
                index
            }
        };

        let id = FilterId(u32::try_from(self.filters.len()).map_err(|_| {
            RuntimeError::InvalidConfig("too many filtering groups".into())
        })?);
        self.filters.push(Filter {
            name: name.to_string(),
            types: types.to_vec(),
            resolution,
        });
        self.by_name.insert(name.to_string(), id);

        tracing::debug!(
            filter = name,
            id = id.0,
            archetypes = self.resolutions[resolution].archetypes.len(),
            "filtering group registered"
        );
        Ok(id)
    }

    /// Adds a freshly created archetype to every resolution it satisfies.
    pub(crate) fn on_archetype_created(&mut self, archetype: &Arc<Archetype>) {
        for resolution in &mut self.resolutions {
            if archetype.signature().is_superset_of(&resolution.set) {
                resolution.archetypes.push(Arc::clone(archetype));
            }
        }
    }

    /// Ordered types and matching archetypes of a filter.
    pub(crate) fn resolve(&self, id: FilterId) -> RuntimeResult<(&[ComponentTypeId], &[Arc<Archetype>])> {
        let filter = self
            .filters
            .get(id.0 as usize)
            .ok_or(RuntimeError::UnknownFilter(id))?;
        Ok((
            &filter.types,
            &self.resolutions[filter.resolution].archetypes,
        ))
    }

    /// Name a filter was registered under.
    pub(crate) fn name(&self, id: FilterId) -> RuntimeResult<&str> {
        self.filters
            .get(id.0 as usize)
            .map(|f| f.name.as_str())
            .ok_or(RuntimeError::UnknownFilter(id))
    }

    /// Number of registered filters.
    pub(crate) fn len(&self) -> usize {
        self.filters.len()
    }
}

/// One column of a chunk view.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ViewColumn {
    pub(crate) type_id: ComponentTypeId,
    pub(crate) size: usize,
    pub(crate) base: NonNull<u8>,
    pub(crate) writable: bool,
}

/// Columnar view over one chunk of one archetype.
///
/// Carries, for each requested component type, the base pointer of that
/// type's array inside the chunk plus the record count. No data is copied.
///
/// Views are only handed out while the owning storage is frozen: either a
/// shared borrow of the component manager (read-only columns) or a borrow
/// held for a whole scheduled frame.
pub struct ChunkView<'w> {
    archetype: ArchetypeId,
    chunk: usize,
    len: usize,
    disposed: bool,
    identity: NonNull<u8>,
    columns: Vec<ViewColumn>,
    _storage: PhantomData<&'w Archetype>,
}

// SAFETY: a view is a set of pointers into chunk memory that outlives 'w.
// Moving it to another thread is sound: writable columns are only granted to
// one view per (chunk, column) at a time, by the manager's `&mut` query or by
// the scheduler's conflict edges.
unsafe impl Send for ChunkView<'_> {}

impl<'w> ChunkView<'w> {
    pub(crate) fn new(
        archetype: ArchetypeId,
        chunk: usize,
        len: usize,
        disposed: bool,
        identity: NonNull<u8>,
        columns: Vec<ViewColumn>,
    ) -> Self {
        Self {
            archetype,
            chunk,
            len,
            disposed,
            identity,
            columns,
            _storage: PhantomData,
        }
    }

    /// Archetype this chunk belongs to.
    #[inline]
    #[must_use]
    pub const fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    /// Chunk index inside its archetype's pools.
    #[inline]
    #[must_use]
    pub const fn chunk_index(&self) -> usize {
        self.chunk
    }

    /// Number of records.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Checks if the chunk holds no records.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for graveyard chunks (groups disposed at the last maintenance pass).
    #[inline]
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Ids of the groups owning each row.
    #[must_use]
    pub fn group_ids(&self) -> &[GroupId] {
        // SAFETY: the identity column holds `len` initialized `GroupId`s,
        // aligned by the pool layout, and is never writable through a view.
        unsafe { std::slice::from_raw_parts(self.identity.as_ptr().cast::<GroupId>(), self.len) }
    }

    /// Component types available in this view, in request order.
    pub fn component_types(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.columns.iter().map(|c| c.type_id)
    }

    /// Checks whether a column may be borrowed mutably.
    #[must_use]
    pub fn is_writable(&self, ty: ComponentTypeId) -> bool {
        self.find(ty).is_ok_and(|c| c.writable)
    }

    /// Raw bytes of one column.
    ///
    /// # Errors
    ///
    /// `MissingColumn` if the type was not requested.
    pub fn column_bytes(&self, ty: ComponentTypeId) -> RuntimeResult<&[u8]> {
        let column = self.find(ty)?;
        // SAFETY: the column spans `len * size` initialized bytes of a live
        // chunk; shared access is exclusive of writers for this borrow.
        Ok(unsafe { std::slice::from_raw_parts(column.base.as_ptr(), self.len * column.size) })
    }

    /// Typed read access to a column.
    ///
    /// # Errors
    ///
    /// `MissingColumn` if the type was not requested, `TypeMismatch` if `C`
    /// does not match the registered layout.
    pub fn column<C: Component>(&self) -> RuntimeResult<&[C]> {
        let column = *self.find(C::ID)?;
        cast_slice(&column, self.column_bytes(C::ID)?, self.len)
    }

    /// Typed write access to a column.
    ///
    /// # Errors
    ///
    /// `ReadOnlyColumn` if the column is not writable in this view, plus the
    /// errors of [`ChunkView::column`].
    pub fn column_mut<C: Component>(&mut self) -> RuntimeResult<&mut [C]> {
        let column = self.find_writable(C::ID)?;
        // SAFETY: the column is writable, so no other view aliases it, and
        // `&mut self` prevents a second borrow through this view.
        let bytes = unsafe { column_bytes_mut(&column, self.len) };
        cast_slice_mut(&column, bytes, self.len)
    }

    /// Reads one column while writing another.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if both types are the same, plus the errors of
    /// [`ChunkView::column`] and [`ChunkView::column_mut`].
    pub fn read_write<R: Component, W: Component>(&mut self) -> RuntimeResult<(&[R], &mut [W])> {
        if R::ID == W::ID {
            return Err(RuntimeError::InvalidConfig(format!(
                "{} borrowed as both read and write",
                R::NAME
            )));
        }
        let read = *self.find(R::ID)?;
        let write = self.find_writable(W::ID)?;
        // SAFETY: distinct columns never overlap; the read column is not
        // written through this view while `&mut self` is held.
        let read_bytes =
            unsafe { std::slice::from_raw_parts(read.base.as_ptr(), self.len * read.size) };
        // SAFETY: as in `column_mut`.
        let write_bytes = unsafe { column_bytes_mut(&write, self.len) };
        Ok((
            cast_slice(&read, read_bytes, self.len)?,
            cast_slice_mut(&write, write_bytes, self.len)?,
        ))
    }

    /// Writes two columns at once.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if both types are the same, plus the errors of
    /// [`ChunkView::column_mut`].
    pub fn column_pair_mut<A: Component, B: Component>(
        &mut self,
    ) -> RuntimeResult<(&mut [A], &mut [B])> {
        if A::ID == B::ID {
            return Err(RuntimeError::InvalidConfig(format!(
                "{} borrowed mutably twice",
                A::NAME
            )));
        }
        let a = self.find_writable(A::ID)?;
        let b = self.find_writable(B::ID)?;
        // SAFETY: distinct writable columns never overlap.
        let (a_bytes, b_bytes) =
            unsafe { (column_bytes_mut(&a, self.len), column_bytes_mut(&b, self.len)) };
        Ok((
            cast_slice_mut(&a, a_bytes, self.len)?,
            cast_slice_mut(&b, b_bytes, self.len)?,
        ))
    }

    fn find(&self, ty: ComponentTypeId) -> RuntimeResult<&ViewColumn> {
        self.columns
            .iter()
            .find(|c| c.type_id == ty)
            .ok_or(RuntimeError::MissingColumn(ty))
    }

    fn find_writable(&self, ty: ComponentTypeId) -> RuntimeResult<ViewColumn> {
        let column = *self.find(ty)?;
        if column.writable {
            Ok(column)
        } else {
            Err(RuntimeError::ReadOnlyColumn(ty))
        }
    }
}

impl std::fmt::Debug for ChunkView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkView")
            .field("archetype", &self.archetype)
            .field("chunk", &self.chunk)
            .field("len", &self.len)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

/// # Safety
///
/// The caller must hold the only access to this column's memory for the
/// returned lifetime.
unsafe fn column_bytes_mut<'a>(column: &ViewColumn, len: usize) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(column.base.as_ptr(), len * column.size)
}

/// Tag components carry no bytes; their slices only need the right length.
fn zero_sized<'a, C>(len: usize) -> &'a mut [C] {
    // SAFETY: `C` is zero-sized, so any aligned non-null pointer is valid
    // for `len` elements and nothing is ever read or written through it.
    unsafe { std::slice::from_raw_parts_mut(NonNull::<C>::dangling().as_ptr(), len) }
}

fn cast_slice<'a, C: Pod>(
    column: &ViewColumn,
    bytes: &'a [u8],
    len: usize,
) -> RuntimeResult<&'a [C]> {
    check_size::<C>(column)?;
    if column.size == 0 {
        return Ok(zero_sized(len));
    }
    bytemuck::try_cast_slice(bytes).map_err(|_| mismatch::<C>(column))
}

fn cast_slice_mut<'a, C: Pod>(
    column: &ViewColumn,
    bytes: &'a mut [u8],
    len: usize,
) -> RuntimeResult<&'a mut [C]> {
    check_size::<C>(column)?;
    if column.size == 0 {
        return Ok(zero_sized(len));
    }
    bytemuck::try_cast_slice_mut(bytes).map_err(|_| mismatch::<C>(column))
}

fn check_size<C>(column: &ViewColumn) -> RuntimeResult<()> {
    if std::mem::size_of::<C>() == column.size {
        Ok(())
    } else {
        Err(mismatch::<C>(column))
    }
}

fn mismatch<C>(column: &ViewColumn) -> RuntimeError {
    RuntimeError::TypeMismatch {
        component: column.type_id,
        expected: column.size,
        actual: std::mem::size_of::<C>(),
    }
}
