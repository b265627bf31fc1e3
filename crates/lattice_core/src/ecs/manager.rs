//! # Component Manager
//!
//! Owns every archetype, every component group and the out-of-line buffer
//! stores, and runs the frame-boundary maintenance pass.
//!
//! ## Phases
//!
//! ```text
//!  frame N running           maintenance            frame N+1 running
//! ┌──────────────────┐   ┌───────────────────┐   ┌──────────────────┐
//! │ &ComponentManager│   │ &mut Component-   │   │ &ComponentManager│
//! │ frozen storage,  │──>│ Manager: purge,   │──>│ frozen storage,  │
//! │ chunk views      │   │ move, bury        │   │ chunk views      │
//! └──────────────────┘   └───────────────────┘   └──────────────────┘
//! ```
//!
//! `create_group` and `destroy_group` only take `&self`: creation appends
//! records past the end of existing views, and destruction is staged until
//! the next pass. `rebuild_group` takes `&mut self` because replacing a
//! staged migration frees the abandoned target slot.
//!
//! ## Disposal
//!
//! `destroy_group` stages the id. Pass N releases the group's buffer stores
//! and moves its record into the archetype's graveyard pools, where queries
//! with `disposed = true` still see it. Pass N+1 frees the graveyard record
//! and forgets the id.
//!
//! ## Buffer Stores
//!
//! Each store is owned by one `(group, component)` pair in a manager-side
//! table. The handle written into the record header is a mirror for code
//! reading raw chunk memory; systems may overwrite it through writable views
//! without affecting which store a group owns.
//!
//! A maintenance pass that fails part-way returns the error with every
//! unprocessed change still staged, so the next pass retries it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use super::archetype::{Archetype, ArchetypeSignature, Column};
use super::component::{Component, ComponentRegistry, ComponentTypeId};
use super::entity::{GroupId, GroupIdAllocator};
use super::filter::{ChunkView, FilterId, FilteringIndex, ViewColumn};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::{PoolHandle, StoreHandle, StorePool};

// ============================================================================
// Bookkeeping
// ============================================================================

/// Where a group's committed record lives.
#[derive(Clone, Debug)]
struct GroupRecord {
    archetype: Arc<Archetype>,
    handle: PoolHandle,
    /// Buried at the last maintenance pass.
    disposed: bool,
}

/// A slot allocated by `rebuild_group`, committed at the next pass.
#[derive(Debug)]
struct PendingMove {
    archetype: Arc<Archetype>,
    handle: PoolHandle,
}

/// Store pool plus the group component owning each allocated store.
#[derive(Debug)]
struct BufferStores {
    pool: StorePool,
    owners: HashMap<(GroupId, ComponentTypeId), StoreHandle>,
}

impl BufferStores {
    fn create(&mut self, id: GroupId, ty: ComponentTypeId, len: usize) -> RuntimeResult<StoreHandle> {
        let store = self.pool.allocate(len)?;
        if let Some(old) = self.owners.insert((id, ty), store) {
            self.pool.release(old);
        }
        Ok(store)
    }

    fn owned(&self, id: GroupId, ty: ComponentTypeId) -> Option<StoreHandle> {
        self.owners.get(&(id, ty)).copied()
    }

    fn release(&mut self, id: GroupId, ty: ComponentTypeId) {
        if let Some(store) = self.owners.remove(&(id, ty)) {
            self.pool.release(store);
        }
    }

    /// Releases the stores of buffered `columns` that `kept` does not carry.
    fn release_dropped(&mut self, id: GroupId, columns: &[Column], kept: Option<&ArchetypeSignature>) {
        for column in columns {
            if column.buffer.is_some() && !kept.is_some_and(|s| s.contains(column.type_id)) {
                self.release(id, column.type_id);
            }
        }
    }
}

/// Counts from one maintenance pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Graveyard records freed (groups forgotten).
    pub purged: usize,
    /// Groups migrated to a new archetype.
    pub moved: usize,
    /// Groups moved into the graveyard.
    pub disposed: usize,
}

/// Storage occupancy summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Live groups.
    pub groups: usize,
    /// Groups held in graveyard pools.
    pub graveyard_groups: usize,
    /// Archetypes created so far.
    pub archetypes: usize,
    /// Registered filtering groups.
    pub filters: usize,
    /// Migrations waiting for the next pass.
    pub pending_moves: usize,
    /// Disposals waiting for the next pass.
    pub pending_disposals: usize,
    /// Allocated buffer stores.
    pub buffer_stores: usize,
    /// Active live chunks, counted once per archetype.
    pub live_chunks: usize,
}

// ============================================================================
// Component Manager
// ============================================================================

/// Archetype storage and group lifecycle.
///
/// # Example
///
/// ```rust,ignore
/// let manager = ComponentManager::new(Arc::new(registry), RuntimeConfig::default());
/// let ship = manager.create_group(&[Position::ID, Velocity::ID])?;
/// manager.destroy_group(ship)?;
/// manager.run_frame_boundary_maintenance()?; // ship is in the graveyard
/// manager.run_frame_boundary_maintenance()?; // ship is gone
/// ```
pub struct ComponentManager {
    registry: Arc<ComponentRegistry>,
    config: RuntimeConfig,
    archetypes: RwLock<HashMap<ArchetypeSignature, Arc<Archetype>>>,
    filters: RwLock<FilteringIndex>,
    groups: RwLock<HashMap<GroupId, GroupRecord>>,
    pending_moves: Mutex<HashMap<GroupId, PendingMove>>,
    pending_disposals: Mutex<BTreeSet<GroupId>>,
    /// Buried at the last pass; purged at the next one.
    graveyard: Vec<GroupId>,
    stores: Mutex<BufferStores>,
    ids: GroupIdAllocator,
}

impl ComponentManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(registry: Arc<ComponentRegistry>, config: RuntimeConfig) -> Self {
        let stores = BufferStores {
            pool: StorePool::new(config.max_buffer_stores),
            owners: HashMap::new(),
        };
        Self {
            registry,
            config,
            archetypes: RwLock::new(HashMap::new()),
            filters: RwLock::new(FilteringIndex::default()),
            groups: RwLock::new(HashMap::new()),
            pending_moves: Mutex::new(HashMap::new()),
            pending_disposals: Mutex::new(BTreeSet::new()),
            graveyard: Vec::new(),
            stores: Mutex::new(stores),
            ids: GroupIdAllocator::new(),
        }
    }

    /// The component registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// The runtime configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Archetypes and filters
    // ------------------------------------------------------------------------

    /// Resolves the archetype for a component-type set, creating it on
    /// first use.
    ///
    /// Lookups share a read lock. Creation upgrades to exclusive access and
    /// re-checks, so racing callers all get the same instance.
    ///
    /// # Errors
    ///
    /// `UnknownComponent` if a type is not registered.
    pub fn archetype(&self, types: &[ComponentTypeId]) -> RuntimeResult<Arc<Archetype>> {
        let signature = ArchetypeSignature::new(types);
        if let Some(existing) = self.archetypes.read().get(&signature) {
            return Ok(Arc::clone(existing));
        }

        let archetypes = self.archetypes.upgradable_read();
        if let Some(existing) = archetypes.get(&signature) {
            return Ok(Arc::clone(existing));
        }
        let mut archetypes = RwLockUpgradableReadGuard::upgrade(archetypes);

        let id = u32::try_from(archetypes.len())
            .map_err(|_| RuntimeError::InvalidConfig("too many archetypes".into()))?;
        let archetype = Arc::new(Archetype::new(
            id,
            signature.clone(),
            &self.registry,
            &self.config,
        )?);
        archetypes.insert(signature, Arc::clone(&archetype));
        self.filters.write().on_archetype_created(&archetype);

        tracing::debug!(
            archetype = id,
            components = ?archetype.signature().types(),
            "archetype created"
        );
        Ok(archetype)
    }

    /// Number of archetypes created so far.
    #[must_use]
    pub fn archetype_count(&self) -> usize {
        self.archetypes.read().len()
    }

    /// Registers a named filtering group.
    ///
    /// Registering the same name with the same list again returns the
    /// original id.
    ///
    /// # Errors
    ///
    /// `FilterConflict` if the name is taken by a different list,
    /// `UnknownComponent` for unregistered types.
    pub fn register_filter(&self, name: &str, types: &[ComponentTypeId]) -> RuntimeResult<FilterId> {
        if let Some(&missing) = types.iter().find(|&&ty| !self.registry.contains(ty)) {
            return Err(RuntimeError::UnknownComponent(missing));
        }
        let archetypes = self.archetypes.read();
        self.filters.write().register(name, types, archetypes.values())
    }

    /// Name a filtering group was registered under.
    ///
    /// # Errors
    ///
    /// `UnknownFilter` for ids this manager never issued.
    pub fn filter_name(&self, filter: FilterId) -> RuntimeResult<String> {
        self.filters.read().name(filter).map(str::to_string)
    }

    /// Sets the empty-chunk reservation of every pool.
    pub fn set_reserved_empty_chunks(&mut self, count: usize) {
        self.config.reserved_empty_chunks = count;
        for archetype in self.archetypes.get_mut().values() {
            archetype.set_reserved_empty_chunks(count);
        }
    }

    // ------------------------------------------------------------------------
    // Group lifecycle
    // ------------------------------------------------------------------------

    /// Creates a group with the given components plus the identity.
    ///
    /// Records start from each component's default bytes; buffered
    /// components get a fresh store.
    ///
    /// # Errors
    ///
    /// `UnknownComponent`, or resource exhaustion from the pools.
    pub fn create_group(&self, types: &[ComponentTypeId]) -> RuntimeResult<GroupId> {
        let archetype = self.archetype(types)?;
        let id = self.ids.next();
        let handle = self.allocate_slot(&archetype, id, None)?;

        self.groups.write().insert(
            id,
            GroupRecord {
                archetype,
                handle,
                disposed: false,
            },
        );
        tracing::trace!(group = id.raw(), "group created");
        Ok(id)
    }

    /// Creates a group from a template registered on the component registry.
    ///
    /// # Errors
    ///
    /// `UnknownTemplate`, plus the errors of [`ComponentManager::create_group`].
    pub fn create_group_from_template(&self, name: &str) -> RuntimeResult<GroupId> {
        let types = self.registry.template(name)?.to_vec();
        self.create_group(&types)
    }

    /// Stages a group for disposal. Nothing changes until the next pass.
    ///
    /// Staging the same group twice is harmless.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the group is not live.
    pub fn destroy_group(&self, id: GroupId) -> RuntimeResult<()> {
        self.live_record(id)?;
        self.pending_disposals.lock().insert(id);
        Ok(())
    }

    /// Stages a migration of `id` to the archetype for `types`.
    ///
    /// The target slot is allocated now; components shared with the current
    /// archetype are copied at the next pass. Until then, reads still see
    /// the current record. A second rebuild before the pass replaces the
    /// first: its target slot and the stores created for it are released
    /// before the new slot is allocated.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the group is not live, `UnknownComponent`, or
    /// resource exhaustion from the pools. On error no migration is staged.
    pub fn rebuild_group(&mut self, id: GroupId, types: &[ComponentTypeId]) -> RuntimeResult<()> {
        let current = self.live_record(id)?;
        let target = self.archetype(types)?;

        if let Some(previous) = self.pending_moves.get_mut().remove(&id) {
            self.discard_move(id, &current.archetype, &previous)?;
        }
        if Arc::ptr_eq(&target, &current.archetype) {
            return Ok(());
        }

        let handle = self.allocate_slot(&target, id, Some(current.archetype.signature()))?;
        self.pending_moves.get_mut().insert(
            id,
            PendingMove {
                archetype: target,
                handle,
            },
        );
        Ok(())
    }

    /// Stages adding a component type to a group.
    ///
    /// # Errors
    ///
    /// See [`ComponentManager::rebuild_group`].
    pub fn add_component(&mut self, id: GroupId, ty: ComponentTypeId) -> RuntimeResult<()> {
        let mut types = self.staged_types(id)?;
        types.push(ty);
        self.rebuild_group(id, &types)
    }

    /// Stages removing a component type from a group.
    ///
    /// # Errors
    ///
    /// `ComponentNotInGroup` if the group does not carry the type (the
    /// identity can never be removed), plus the errors of
    /// [`ComponentManager::rebuild_group`].
    pub fn remove_component(&mut self, id: GroupId, ty: ComponentTypeId) -> RuntimeResult<()> {
        let mut types = self.staged_types(id)?;
        let not_in_group = RuntimeError::ComponentNotInGroup {
            group: id,
            component: ty,
        };
        if ty == ComponentTypeId::IDENTITY {
            return Err(not_in_group);
        }
        let position = types.iter().position(|&t| t == ty).ok_or(not_in_group)?;
        types.remove(position);
        self.rebuild_group(id, &types)
    }

    /// Applies every staged change. Single-threaded by construction.
    ///
    /// In order:
    /// 1. Frees the graveyard records buried at the previous pass and
    ///    forgets their ids.
    /// 2. Commits migrations: copies shared components into the new slot,
    ///    releases stores of dropped buffered components, frees the old slot.
    /// 3. Buries disposed groups: releases their buffer stores and moves
    ///    their records into the graveyard pools.
    ///
    /// # Errors
    ///
    /// Resource exhaustion from the graveyard pools. The failing change and
    /// every change after it stay staged for the next pass.
    pub fn run_frame_boundary_maintenance(&mut self) -> RuntimeResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let groups = self.groups.get_mut();
        let stores = self.stores.get_mut();

        let buried = std::mem::take(&mut self.graveyard);
        for (done, &id) in buried.iter().enumerate() {
            let Some(record) = groups.get(&id) else {
                continue;
            };
            if let Err(err) = record.archetype.storage().purge(record.handle) {
                self.graveyard.extend_from_slice(&buried[done..]);
                return Err(err);
            }
            groups.remove(&id);
            report.purged += 1;
        }

        let pending_moves = self.pending_moves.get_mut();
        let mut moves = std::mem::take(pending_moves).into_iter();
        while let Some((id, pending)) = moves.next() {
            let Some(record) = groups.get_mut(&id) else {
                continue;
            };
            if let Err(err) = commit_move(stores, id, record, &pending) {
                pending_moves.insert(id, pending);
                pending_moves.extend(moves);
                return Err(err);
            }
            record.archetype = pending.archetype;
            record.handle = pending.handle;
            report.moved += 1;
        }

        let pending_disposals = self.pending_disposals.get_mut();
        let disposals = std::mem::take(pending_disposals);
        let mut remaining = disposals.iter();
        while let Some(&id) = remaining.next() {
            let Some(record) = groups.get_mut(&id) else {
                continue;
            };
            if record.disposed {
                continue;
            }
            if let Err(err) = bury_group(stores, id, record) {
                tracing::warn!(group = id.raw(), error = %err, "disposal deferred");
                pending_disposals.insert(id);
                pending_disposals.extend(remaining.copied());
                return Err(err);
            }
            self.graveyard.push(id);
            report.disposed += 1;
        }

        tracing::debug!(
            purged = report.purged,
            moved = report.moved,
            disposed = report.disposed,
            "maintenance pass complete"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------------

    /// Checks whether the id is known (live or in the graveyard).
    #[must_use]
    pub fn contains(&self, id: GroupId) -> bool {
        self.groups.read().contains_key(&id)
    }

    /// Checks whether the group was buried at the last pass.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the id is not known.
    pub fn is_disposed(&self, id: GroupId) -> RuntimeResult<bool> {
        Ok(self.record(id)?.disposed)
    }

    /// Committed component types of a group, identity included.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the id is not known.
    pub fn component_types(&self, id: GroupId) -> RuntimeResult<Vec<ComponentTypeId>> {
        Ok(self.record(id)?.archetype.signature().types().to_vec())
    }

    /// Copy of one component's bytes.
    ///
    /// # Errors
    ///
    /// `UnknownGroup`, or `ComponentNotInGroup` if the group lacks the type.
    pub fn component_bytes(&self, id: GroupId, ty: ComponentTypeId) -> RuntimeResult<Vec<u8>> {
        let record = self.record(id)?;
        let column = column_of(&record, id, ty)?;
        let storage = record.archetype.storage();
        Ok(storage.record(record.disposed, column, record.handle)?.to_vec())
    }

    /// Typed copy of one component.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` if `C` does not match the registered size, plus the
    /// errors of [`ComponentManager::component_bytes`].
    pub fn component<C: Component>(&self, id: GroupId) -> RuntimeResult<C> {
        let record = self.record(id)?;
        let column = column_of(&record, id, C::ID)?;
        check_size::<C>(record.archetype.columns()[column].size, C::ID)?;
        let storage = record.archetype.storage();
        let bytes = storage.record(record.disposed, column, record.handle)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Overwrites one component of a live group.
    ///
    /// The buffer store header of a buffered component is rewritten with
    /// the group's own store handle.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the group is not live, plus the errors of
    /// [`ComponentManager::component`].
    pub fn set_component<C: Component>(&mut self, id: GroupId, value: C) -> RuntimeResult<()> {
        let record = self.live_record(id)?;
        let column = column_of(&record, id, C::ID)?;
        let info = &record.archetype.columns()[column];
        check_size::<C>(info.size, C::ID)?;

        let store = info
            .buffer
            .zip(self.stores.get_mut().owned(id, C::ID));
        let mut storage = record.archetype.storage();
        let bytes = storage.record_mut(column, record.handle)?;
        bytes.copy_from_slice(bytemuck::bytes_of(&value));
        if let Some((layout, store)) = store {
            store.write(&mut bytes[layout.header_offset..]);
        }
        Ok(())
    }

    /// Copy of a buffered component's store.
    ///
    /// # Errors
    ///
    /// `NotBuffered`, `StaleHandle` once the store was released, plus the
    /// errors of [`ComponentManager::component_bytes`].
    pub fn buffer_store(&self, id: GroupId, ty: ComponentTypeId) -> RuntimeResult<Vec<u8>> {
        let handle = self.store_handle(id, ty)?;
        self.stores
            .lock()
            .pool
            .get(handle)
            .cloned()
            .ok_or_else(|| stale_store(handle))
    }

    /// A buffered component's store, for writing.
    ///
    /// # Errors
    ///
    /// See [`ComponentManager::buffer_store`].
    pub fn buffer_store_mut(&mut self, id: GroupId, ty: ComponentTypeId) -> RuntimeResult<&mut Vec<u8>> {
        let handle = self.store_handle(id, ty)?;
        self.stores
            .get_mut()
            .pool
            .get_mut(handle)
            .ok_or_else(|| stale_store(handle))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Read-only chunk views over every archetype matching a filter.
    ///
    /// `disposed = true` walks the graveyard pools instead of the live ones.
    /// A filter with no matching archetype yet yields an empty list.
    ///
    /// # Errors
    ///
    /// `UnknownFilter` for ids this manager never issued.
    pub fn query_filtering_group(
        &self,
        filter: FilterId,
        disposed: bool,
    ) -> RuntimeResult<Vec<ChunkView<'_>>> {
        self.chunk_views(filter, disposed, &[])
    }

    /// Chunk views whose requested columns are all writable.
    ///
    /// # Errors
    ///
    /// See [`ComponentManager::query_filtering_group`].
    pub fn query_filtering_group_mut(
        &mut self,
        filter: FilterId,
        disposed: bool,
    ) -> RuntimeResult<Vec<ChunkView<'_>>> {
        let types = self.filters.read().resolve(filter)?.0.to_vec();
        self.chunk_views(filter, disposed, &types)
    }

    /// Builds views with the listed columns writable.
    ///
    /// Callers granting write access from `&self` must guarantee that no
    /// other view can reach the same columns while these are alive.
    pub(crate) fn chunk_views(
        &self,
        filter: FilterId,
        disposed: bool,
        writable: &[ComponentTypeId],
    ) -> RuntimeResult<Vec<ChunkView<'_>>> {
        let filters = self.filters.read();
        let (types, archetypes) = filters.resolve(filter)?;

        let mut requested: Vec<ComponentTypeId> = Vec::with_capacity(types.len());
        for &ty in types {
            if !requested.contains(&ty) {
                requested.push(ty);
            }
        }

        let mut views = Vec::new();
        for archetype in archetypes {
            let storage = archetype.storage();
            let identity = archetype.column_index(ComponentTypeId::IDENTITY)?;
            let indices = requested
                .iter()
                .map(|&ty| archetype.column_index(ty))
                .collect::<RuntimeResult<Vec<usize>>>()?;

            for chunk in 0..storage.chunk_count(disposed) {
                let Some((identity_base, len)) = storage.chunk_column(disposed, identity, chunk)
                else {
                    continue;
                };
                let mut columns = Vec::with_capacity(indices.len());
                for (&ty, &index) in requested.iter().zip(&indices) {
                    if let Some((base, _)) = storage.chunk_column(disposed, index, chunk) {
                        columns.push(ViewColumn {
                            type_id: ty,
                            size: archetype.columns()[index].size,
                            base,
                            writable: ty != ComponentTypeId::IDENTITY && writable.contains(&ty),
                        });
                    }
                }
                views.push(ChunkView::new(
                    archetype.id(),
                    chunk,
                    len,
                    disposed,
                    identity_base,
                    columns,
                ));
            }
        }
        Ok(views)
    }

    /// Storage occupancy summary.
    #[must_use]
    pub fn stats(&self) -> StorageStats {
        let groups = self.groups.read();
        let graveyard_groups = groups.values().filter(|r| r.disposed).count();
        let archetypes = self.archetypes.read();
        StorageStats {
            groups: groups.len() - graveyard_groups,
            graveyard_groups,
            archetypes: archetypes.len(),
            filters: self.filters.read().len(),
            pending_moves: self.pending_moves.lock().len(),
            pending_disposals: self.pending_disposals.lock().len(),
            buffer_stores: self.stores.lock().pool.allocated_count(),
            live_chunks: archetypes
                .values()
                .map(|a| a.pool_stats(false).active_chunks)
                .sum(),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn record(&self, id: GroupId) -> RuntimeResult<GroupRecord> {
        self.groups
            .read()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::UnknownGroup(id))
    }

    fn live_record(&self, id: GroupId) -> RuntimeResult<GroupRecord> {
        let record = self.record(id)?;
        if record.disposed {
            return Err(RuntimeError::UnknownGroup(id));
        }
        Ok(record)
    }

    /// Types the group will have after the next pass.
    fn staged_types(&self, id: GroupId) -> RuntimeResult<Vec<ComponentTypeId>> {
        let record = self.live_record(id)?;
        let staged = self
            .pending_moves
            .lock()
            .get(&id)
            .map(|pending| pending.archetype.signature().types().to_vec());
        Ok(staged.unwrap_or_else(|| record.archetype.signature().types().to_vec()))
    }

    fn store_handle(&self, id: GroupId, ty: ComponentTypeId) -> RuntimeResult<StoreHandle> {
        let record = self.record(id)?;
        let column = column_of(&record, id, ty)?;
        let layout = record.archetype.columns()[column]
            .buffer
            .ok_or(RuntimeError::NotBuffered(ty))?;
        if let Some(store) = self.stores.lock().owned(id, ty) {
            return Ok(store);
        }
        // Released: report the handle the header last carried.
        let storage = record.archetype.storage();
        let bytes = storage.record(record.disposed, column, record.handle)?;
        Err(stale_store(StoreHandle::read(&bytes[layout.header_offset..])))
    }

    /// Allocates and initializes a live slot for `id`.
    ///
    /// Buffered components get a new store unless `inherited` already holds
    /// the type; those headers are written at commit time.
    fn allocate_slot(
        &self,
        archetype: &Archetype,
        id: GroupId,
        inherited: Option<&ArchetypeSignature>,
    ) -> RuntimeResult<PoolHandle> {
        let mut storage = archetype.storage();
        let handle = storage.allocate(archetype.columns())?;
        let identity = archetype.column_index(ComponentTypeId::IDENTITY)?;
        storage
            .record_mut(identity, handle)?
            .copy_from_slice(bytemuck::bytes_of(&id));

        let mut stores = self.stores.lock();
        let mut created = Vec::new();
        for (index, column) in archetype.columns().iter().enumerate() {
            let Some(layout) = column.buffer else {
                continue;
            };
            if inherited.is_some_and(|s| s.contains(column.type_id)) {
                continue;
            }
            match stores.create(id, column.type_id, layout.initial_len) {
                Ok(store) => {
                    store.write(&mut storage.record_mut(index, handle)?[layout.header_offset..]);
                    created.push(column.type_id);
                }
                Err(err) => {
                    for ty in created {
                        stores.release(id, ty);
                    }
                    storage.free(handle)?;
                    return Err(err);
                }
            }
        }
        Ok(handle)
    }

    /// Undoes a staged migration that was never committed.
    fn discard_move(
        &mut self,
        id: GroupId,
        current: &Archetype,
        pending: &PendingMove,
    ) -> RuntimeResult<()> {
        self.stores.get_mut().release_dropped(
            id,
            pending.archetype.columns(),
            Some(current.signature()),
        );
        pending.archetype.storage().free(pending.handle)
    }
}

impl std::fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Copies shared components into the staged slot, rewrites its store
/// headers, releases stores the new archetype drops and frees the old slot.
fn commit_move(
    stores: &mut BufferStores,
    id: GroupId,
    record: &GroupRecord,
    pending: &PendingMove,
) -> RuntimeResult<()> {
    let mut from = record.archetype.storage();
    let mut to = pending.archetype.storage();
    for (index, column) in pending.archetype.columns().iter().enumerate() {
        if column.type_id == ComponentTypeId::IDENTITY {
            continue;
        }
        if let Some(old_index) = record.archetype.signature().index_of(column.type_id) {
            let bytes = from.record(false, old_index, record.handle)?;
            to.record_mut(index, pending.handle)?.copy_from_slice(bytes);
        }
        if let Some((layout, store)) = column.buffer.zip(stores.owned(id, column.type_id)) {
            store.write(&mut to.record_mut(index, pending.handle)?[layout.header_offset..]);
        }
    }
    stores.release_dropped(
        id,
        record.archetype.columns(),
        Some(pending.archetype.signature()),
    );
    from.free(record.handle)
}

/// Moves a live record into the graveyard after releasing its stores.
///
/// Graveyard space is reserved first, so exhaustion leaves the group live
/// with its stores intact.
fn bury_group(stores: &mut BufferStores, id: GroupId, record: &mut GroupRecord) -> RuntimeResult<()> {
    let mut storage = record.archetype.storage();
    storage.reserve_graveyard()?;
    stores.release_dropped(id, record.archetype.columns(), None);
    record.handle = storage.bury(record.handle)?;
    record.disposed = true;
    Ok(())
}

fn column_of(record: &GroupRecord, id: GroupId, ty: ComponentTypeId) -> RuntimeResult<usize> {
    record
        .archetype
        .signature()
        .index_of(ty)
        .ok_or(RuntimeError::ComponentNotInGroup {
            group: id,
            component: ty,
        })
}

fn check_size<C>(size: usize, ty: ComponentTypeId) -> RuntimeResult<()> {
    if std::mem::size_of::<C>() == size {
        Ok(())
    } else {
        Err(RuntimeError::TypeMismatch {
            component: ty,
            expected: size,
            actual: std::mem::size_of::<C>(),
        })
    }
}

fn stale_store(handle: StoreHandle) -> RuntimeError {
    RuntimeError::StaleHandle {
        index: handle.index(),
        generation: handle.generation(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::BufferLayout;
    use bytemuck::{Pod, Zeroable};

    #[allow(dead_code)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {
        const ID: ComponentTypeId = ComponentTypeId::new(1);
        const NAME: &'static str = "Position";
    }

    #[allow(dead_code)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Mesh {
        lod: u32,
        store: [u32; 2],
    }

    impl Component for Mesh {
        const ID: ComponentTypeId = ComponentTypeId::new(2);
        const NAME: &'static str = "Mesh";
    }

    fn manager() -> ComponentManager {
        manager_with(RuntimeConfig {
            chunk_capacity: 4,
            ..RuntimeConfig::default()
        })
    }

    fn manager_with(config: RuntimeConfig) -> ComponentManager {
        let registry = ComponentRegistry::builder()
            .register::<Position>()
            .unwrap()
            .register_buffered::<Mesh>(BufferLayout {
                header_offset: 4,
                initial_len: 16,
            })
            .unwrap()
            .build();
        ComponentManager::new(Arc::new(registry), config)
    }

    #[test]
    fn test_create_writes_identity_and_defaults() {
        let manager = manager();
        let id = manager.create_group(&[Position::ID]).unwrap();

        assert_eq!(manager.component::<GroupId>(id).unwrap(), id);
        assert_eq!(manager.component::<Position>(id).unwrap(), Position::default());
        assert_eq!(
            manager.component_types(id).unwrap(),
            vec![ComponentTypeId::IDENTITY, Position::ID]
        );
    }

    #[test]
    fn test_buffered_component_gets_store() {
        let mut manager = manager();
        let id = manager.create_group(&[Mesh::ID]).unwrap();

        assert_eq!(manager.buffer_store(id, Mesh::ID).unwrap(), vec![0u8; 16]);
        manager.buffer_store_mut(id, Mesh::ID).unwrap()[0] = 9;
        assert_eq!(manager.buffer_store(id, Mesh::ID).unwrap()[0], 9);
        assert_eq!(manager.stats().buffer_stores, 1);

        assert_eq!(
            manager.buffer_store(id, ComponentTypeId::IDENTITY),
            Err(RuntimeError::NotBuffered(ComponentTypeId::IDENTITY))
        );
    }

    #[test]
    fn test_set_component_keeps_store_header() {
        let mut manager = manager();
        let id = manager.create_group(&[Mesh::ID]).unwrap();
        manager.buffer_store_mut(id, Mesh::ID).unwrap()[1] = 7;

        manager
            .set_component(id, Mesh {
                lod: 3,
                store: [0, 0],
            })
            .unwrap();

        assert_eq!(manager.component::<Mesh>(id).unwrap().lod, 3);
        assert_eq!(manager.buffer_store(id, Mesh::ID).unwrap()[1], 7);
    }

    #[test]
    fn test_store_follows_migration_and_dies_with_component() {
        let mut manager = manager();
        let id = manager.create_group(&[Mesh::ID]).unwrap();
        manager.buffer_store_mut(id, Mesh::ID).unwrap()[0] = 5;

        manager.add_component(id, Position::ID).unwrap();
        manager.run_frame_boundary_maintenance().unwrap();
        assert_eq!(manager.buffer_store(id, Mesh::ID).unwrap()[0], 5);
        assert_eq!(manager.stats().buffer_stores, 1);

        manager.remove_component(id, Mesh::ID).unwrap();
        manager.run_frame_boundary_maintenance().unwrap();
        assert_eq!(manager.stats().buffer_stores, 0);
        assert!(matches!(
            manager.buffer_store(id, Mesh::ID),
            Err(RuntimeError::ComponentNotInGroup { .. })
        ));
    }

    #[test]
    fn test_second_rebuild_replaces_first() {
        let mut manager = manager();
        let id = manager.create_group(&[Position::ID]).unwrap();

        manager.rebuild_group(id, &[Position::ID, Mesh::ID]).unwrap();
        assert_eq!(manager.stats().buffer_stores, 1);
        manager.rebuild_group(id, &[]).unwrap();
        // The abandoned target slot and its store are gone.
        assert_eq!(manager.stats().buffer_stores, 0);
        assert_eq!(manager.archetype(&[Position::ID, Mesh::ID]).unwrap().len(), 0);

        let report = manager.run_frame_boundary_maintenance().unwrap();
        assert_eq!(report.moved, 1);
        assert_eq!(
            manager.component_types(id).unwrap(),
            vec![ComponentTypeId::IDENTITY]
        );
    }

    #[test]
    fn test_rebuild_back_to_current_cancels() {
        let mut manager = manager();
        let id = manager.create_group(&[Position::ID]).unwrap();

        manager.add_component(id, Mesh::ID).unwrap();
        manager.rebuild_group(id, &[Position::ID]).unwrap();
        assert_eq!(manager.stats().pending_moves, 0);
        assert_eq!(manager.run_frame_boundary_maintenance().unwrap().moved, 0);
    }

    #[test]
    fn test_identity_cannot_be_removed() {
        let mut manager = manager();
        let id = manager.create_group(&[Position::ID]).unwrap();
        assert!(matches!(
            manager.remove_component(id, ComponentTypeId::IDENTITY),
            Err(RuntimeError::ComponentNotInGroup { .. })
        ));
    }

    #[test]
    fn test_disposal_releases_stores() {
        let mut manager = manager();
        let id = manager.create_group(&[Mesh::ID]).unwrap();
        manager.destroy_group(id).unwrap();
        manager.run_frame_boundary_maintenance().unwrap();

        assert_eq!(manager.stats().buffer_stores, 0);
        assert!(manager.is_disposed(id).unwrap());
        assert!(matches!(
            manager.buffer_store(id, Mesh::ID),
            Err(RuntimeError::StaleHandle { .. })
        ));
        assert!(manager.destroy_group(id).is_err());
    }

    #[test]
    fn test_typed_access_checks_size() {
        let manager = manager();
        let id = manager.create_group(&[Position::ID]).unwrap();

        #[allow(dead_code)]
        #[derive(Clone, Copy, Default, Pod, Zeroable)]
        #[repr(C)]
        struct Wide([f32; 3]);
        impl Component for Wide {
            const ID: ComponentTypeId = Position::ID;
            const NAME: &'static str = "Wide";
        }

        assert!(matches!(
            manager.component::<Wide>(id),
            Err(RuntimeError::TypeMismatch {
                expected: 8,
                actual: 12,
                ..
            })
        ));
    }

    #[test]
    fn test_overwritten_header_does_not_change_store_owner() {
        let mut manager = manager();
        let kept = manager.create_group(&[Mesh::ID]).unwrap();
        let doomed = manager.create_group(&[Mesh::ID]).unwrap();
        manager.buffer_store_mut(kept, Mesh::ID).unwrap()[0] = 4;
        let filter = manager.register_filter("meshes", &[Mesh::ID]).unwrap();

        let mut views = manager.query_filtering_group_mut(filter, false).unwrap();
        for view in &mut views {
            for mesh in view.column_mut::<Mesh>().unwrap() {
                *mesh = Mesh {
                    lod: 2,
                    store: [0, 0],
                };
            }
        }
        drop(views);

        manager.destroy_group(doomed).unwrap();
        manager.run_frame_boundary_maintenance().unwrap();

        assert_eq!(manager.stats().buffer_stores, 1);
        assert_eq!(manager.buffer_store(kept, Mesh::ID).unwrap()[0], 4);
        assert!(matches!(
            manager.buffer_store(doomed, Mesh::ID),
            Err(RuntimeError::StaleHandle { .. })
        ));
    }

    #[test]
    fn test_set_component_restores_owned_header() {
        let mut manager = manager();
        let id = manager.create_group(&[Mesh::ID]).unwrap();
        let owned = manager.stores.lock().owned(id, Mesh::ID).unwrap();

        manager
            .set_component(id, Mesh {
                lod: 1,
                store: [u32::MAX, u32::MAX],
            })
            .unwrap();

        let mesh = manager.component::<Mesh>(id).unwrap();
        assert_eq!(mesh.lod, 1);
        assert_eq!(StoreHandle::read(bytemuck::bytes_of(&mesh.store)), owned);
    }

    #[test]
    fn test_exhausted_graveyard_keeps_disposal_staged() {
        let mut manager = manager_with(RuntimeConfig {
            chunk_capacity: 4,
            graveyard_chunk_capacity: 1,
            max_chunks_per_pool: Some(1),
            ..RuntimeConfig::default()
        });
        let first = manager.create_group(&[Mesh::ID]).unwrap();
        let second = manager.create_group(&[Mesh::ID]).unwrap();
        manager.buffer_store_mut(second, Mesh::ID).unwrap()[0] = 3;
        manager.destroy_group(first).unwrap();
        manager.destroy_group(second).unwrap();

        assert_eq!(
            manager.run_frame_boundary_maintenance(),
            Err(RuntimeError::PoolExhausted { limit: 1 })
        );
        assert!(manager.is_disposed(first).unwrap());
        assert!(!manager.is_disposed(second).unwrap());
        assert_eq!(manager.buffer_store(second, Mesh::ID).unwrap()[0], 3);
        assert_eq!(manager.stats().pending_disposals, 1);

        // Purging the first group frees the graveyard chunk for the retry.
        let report = manager.run_frame_boundary_maintenance().unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(report.disposed, 1);
        assert!(!manager.contains(first));
        assert!(manager.is_disposed(second).unwrap());
        assert_eq!(manager.stats().buffer_stores, 0);
    }

    #[test]
    fn test_replaced_rebuild_frees_abandoned_slot_only() {
        let mut manager = manager();
        let moving = manager.create_group(&[Position::ID]).unwrap();
        manager.add_component(moving, Mesh::ID).unwrap();
        manager.run_frame_boundary_maintenance().unwrap();
        let other = manager.create_group(&[Position::ID, Mesh::ID]).unwrap();
        manager.buffer_store_mut(other, Mesh::ID).unwrap()[2] = 8;

        manager.rebuild_group(moving, &[Position::ID]).unwrap();
        manager.rebuild_group(moving, &[Mesh::ID]).unwrap();
        manager.run_frame_boundary_maintenance().unwrap();

        let meshes = manager.archetype(&[Position::ID, Mesh::ID]).unwrap();
        assert_eq!(meshes.len(), 1);
        assert_eq!(manager.component::<GroupId>(other).unwrap(), other);
        assert_eq!(manager.buffer_store(other, Mesh::ID).unwrap()[2], 8);
        assert_eq!(
            manager.component_types(moving).unwrap(),
            vec![ComponentTypeId::IDENTITY, Mesh::ID]
        );
        assert_eq!(manager.stats().buffer_stores, 2);
    }
}
