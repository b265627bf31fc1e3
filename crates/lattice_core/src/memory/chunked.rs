//! # Chunked Object Pool
//!
//! Fixed-capacity slabs of same-sized raw records with stable handles.
//!
//! ## Layout
//!
//! ```text
//! chunks:  [ full ][ full ][ partial ][ reserved empty ][ reserved empty ]
//!          |<------ active_chunks ----->|
//! slots:   handle.index -> { generation, (chunk, row) }
//! ```
//!
//! Only the last active chunk may be partially filled. Removal copies the
//! last record over the freed one and patches the moved record's slot entry,
//! so handles stay valid while the data underneath them is compacted.
//!
//! ## Concurrency
//!
//! Mutation takes `&mut self`. Owners serialize access (archetypes keep their
//! pools behind one storage lock). Raw chunk pointers handed out through
//! [`ChunkedPool::chunk_records`] stay valid until the next `free` or
//! `set_reserved_empty_chunks` call.

// SAFETY: This module owns raw chunk allocations.
// All unsafe blocks are documented at the point of use.
#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use bytemuck::{Pod, Zeroable};

use crate::error::{RuntimeError, RuntimeResult};

/// Stable handle to a pool record.
///
/// Packs a slot index and the slot's generation into 64 bits. Freeing a
/// record bumps the generation, so an old handle is detectably stale even
/// after its slot index is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct PoolHandle {
    index: u32,
    generation: u32,
}

impl PoolHandle {
    /// Null handle. Never resolves.
    pub const NULL: Self = Self {
        index: u32::MAX,
        generation: u32::MAX,
    };

    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the handle into an opaque 64-bit value.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Rebuilds a handle from [`PoolHandle::to_bits`].
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    /// Checks for the null handle.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index == u32::MAX && self.generation == u32::MAX
    }
}

impl Default for PoolHandle {
    fn default() -> Self {
        Self::NULL
    }
}

/// Indirection entry for one handle slot.
#[derive(Clone, Copy, Debug)]
struct SlotEntry {
    generation: u32,
    /// `(chunk, row)` while live.
    location: Option<(u32, u32)>,
}

/// One slab of records.
struct Chunk {
    data: NonNull<u8>,
    layout: Layout,
    /// Slot index owning each occupied row; `owners.len()` is the record count.
    owners: Vec<u32>,
}

impl Chunk {
    fn allocate(layout: Layout, capacity: usize) -> RuntimeResult<Self> {
        // SAFETY: layout has a non-zero size (see `ChunkedPool::chunk_layout`).
        let ptr = unsafe { alloc_zeroed(layout) };
        let data = NonNull::new(ptr).ok_or(RuntimeError::OutOfMemory {
            bytes: layout.size(),
        })?;
        Ok(Self {
            data,
            layout,
            owners: Vec::with_capacity(capacity),
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.owners.len()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: data was allocated in `Chunk::allocate` with this layout.
        unsafe { dealloc(self.data.as_ptr(), self.layout) }
    }
}

/// Occupancy summary for a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live records.
    pub records: usize,
    /// Chunks in the active range.
    pub active_chunks: usize,
    /// Empty chunks retained past the active range.
    pub reserved_chunks: usize,
    /// Bytes held by all chunks.
    pub bytes_reserved: usize,
}

/// Chunked pool of fixed-size raw records.
///
/// # Example
///
/// ```rust,ignore
/// let mut pool = ChunkedPool::new(16, 8, 4, 1, None)?;
/// let h = pool.allocate()?;
/// pool.record_mut(h)?.copy_from_slice(&[1u8; 16]);
/// pool.free(h)?;
/// ```
pub struct ChunkedPool {
    record_size: usize,
    chunk_capacity: usize,
    chunk_layout: Layout,
    /// `[0, active_chunks)` in use, the remainder are reserved empties.
    chunks: Vec<Chunk>,
    active_chunks: usize,
    reserved_limit: usize,
    max_chunks: Option<usize>,
    slots: Vec<SlotEntry>,
    free_slots: Vec<u32>,
    records: usize,
}

// SAFETY: the pool exclusively owns its chunk allocations; the raw pointers
// are never shared except through the documented `chunk_records` contract.
unsafe impl Send for ChunkedPool {}
// SAFETY: `&ChunkedPool` only permits reads.
unsafe impl Sync for ChunkedPool {}

impl ChunkedPool {
    /// Creates an empty pool. No chunk is allocated until the first record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the capacity is zero or the layout overflows.
    pub fn new(
        record_size: usize,
        record_align: usize,
        chunk_capacity: usize,
        reserved_empty_chunks: usize,
        max_chunks: Option<usize>,
    ) -> RuntimeResult<Self> {
        if chunk_capacity == 0 {
            return Err(RuntimeError::InvalidConfig("chunk capacity must be > 0".into()));
        }
        let bytes = record_size
            .checked_mul(chunk_capacity)
            .ok_or_else(|| RuntimeError::InvalidConfig("chunk size overflows".into()))?;
        let align = record_align.max(1);
        // Zero-sized records still get a real (tiny) allocation.
        let chunk_layout = Layout::from_size_align(bytes.max(align), align)
            .map_err(|e| RuntimeError::InvalidConfig(format!("chunk layout: {e}")))?;

        Ok(Self {
            record_size,
            chunk_capacity,
            chunk_layout,
            chunks: Vec::new(),
            active_chunks: 0,
            reserved_limit: reserved_empty_chunks,
            max_chunks,
            slots: Vec::new(),
            free_slots: Vec::new(),
            records: 0,
        })
    }

    /// Size of one record in bytes.
    #[inline]
    #[must_use]
    pub const fn record_size(&self) -> usize {
        self.record_size
    }

    /// Records per chunk.
    #[inline]
    #[must_use]
    pub const fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Number of live records.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.records
    }

    /// Checks if the pool holds no records.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Number of chunks in the active range.
    #[inline]
    #[must_use]
    pub const fn active_chunk_count(&self) -> usize {
        self.active_chunks
    }

    /// Number of allocated chunks, active and reserved.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Allocates a zeroed record.
    ///
    /// Appends to the last active chunk, activating a reserved empty chunk
    /// or allocating a fresh one when it is full.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` when the chunk limit is reached, `OutOfMemory` when
    /// the system allocator fails.
    pub fn allocate(&mut self) -> RuntimeResult<PoolHandle> {
        if self.needs_chunk() {
            self.reserve()?;
            self.active_chunks += 1;
        }

        let chunk_index = self.active_chunks - 1;
        let slot_index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| RuntimeError::PoolExhausted { limit: u32::MAX as usize })?;
                self.slots.push(SlotEntry {
                    generation: 0,
                    location: None,
                });
                index
            }
        };

        let chunk = &mut self.chunks[chunk_index];
        let row = chunk.len();
        chunk.owners.push(slot_index);
        // SAFETY: row < chunk_capacity, so the record lies inside the allocation.
        unsafe {
            std::ptr::write_bytes(
                chunk.data.as_ptr().add(row * self.record_size),
                0,
                self.record_size,
            );
        }

        let entry = &mut self.slots[slot_index as usize];
        entry.location = Some((chunk_index as u32, row as u32));
        self.records += 1;

        Ok(PoolHandle {
            index: slot_index,
            generation: entry.generation,
        })
    }

    /// Frees a record, compacting by moving the last record into its place.
    ///
    /// # Errors
    ///
    /// `StaleHandle` if the handle is not live in this pool.
    pub fn free(&mut self, handle: PoolHandle) -> RuntimeResult<()> {
        let (chunk_index, row) = self.locate(handle)?;

        let last_chunk = self.active_chunks - 1;
        let last_row = self.chunks[last_chunk].len() - 1;

        if (chunk_index, row) != (last_chunk, last_row) {
            let size = self.record_size;
            let src = self.chunks[last_chunk].data.as_ptr();
            let dst = self.chunks[chunk_index].data.as_ptr();
            // SAFETY: both rows are occupied and distinct; when the chunks are
            // the same, distinct rows of `size` bytes cannot overlap.
            unsafe {
                std::ptr::copy_nonoverlapping(src.add(last_row * size), dst.add(row * size), size);
            }

            let moved = self.chunks[last_chunk].owners[last_row];
            self.chunks[chunk_index].owners[row] = moved;
            self.slots[moved as usize].location = Some((chunk_index as u32, row as u32));
        }
        self.chunks[last_chunk].owners.pop();

        let entry = &mut self.slots[handle.index as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.location = None;
        self.free_slots.push(handle.index);
        self.records -= 1;

        if self.chunks[last_chunk].len() == 0 {
            self.active_chunks -= 1;
            self.trim_reserved();
        }
        Ok(())
    }

    /// Resolves a handle to the start of its record.
    ///
    /// # Errors
    ///
    /// `StaleHandle` if the handle is not live in this pool.
    pub fn resolve(&self, handle: PoolHandle) -> RuntimeResult<NonNull<u8>> {
        let (chunk_index, row) = self.locate(handle)?;
        let base = self.chunks[chunk_index].data.as_ptr();
        // SAFETY: row is occupied, so the offset stays inside the non-null
        // allocation.
        Ok(unsafe { NonNull::new_unchecked(base.add(row * self.record_size)) })
    }

    /// Returns the bytes of a live record.
    ///
    /// # Errors
    ///
    /// `StaleHandle` if the handle is not live in this pool.
    pub fn record(&self, handle: PoolHandle) -> RuntimeResult<&[u8]> {
        let ptr = self.resolve(handle)?;
        // SAFETY: the record is `record_size` initialized bytes owned by self.
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.record_size) })
    }

    /// Returns the bytes of a live record for writing.
    ///
    /// # Errors
    ///
    /// `StaleHandle` if the handle is not live in this pool.
    pub fn record_mut(&mut self, handle: PoolHandle) -> RuntimeResult<&mut [u8]> {
        let ptr = self.resolve(handle)?;
        // SAFETY: `&mut self` guarantees no other borrow of the record.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.record_size) })
    }

    /// Checks whether a handle is live in this pool.
    #[must_use]
    pub fn contains(&self, handle: PoolHandle) -> bool {
        self.locate(handle).is_ok()
    }

    /// Guarantees that the next `allocate` cannot fail for lack of a chunk.
    ///
    /// When the active range is full and no reserved empty chunk is left, a
    /// new chunk is allocated and parked as reserved. Parallel pools call
    /// this on every member before allocating in any of them, so a failure
    /// leaves all of them with identical active ranges.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` when the chunk limit is reached, `OutOfMemory` when
    /// the system allocator fails.
    pub fn reserve(&mut self) -> RuntimeResult<()> {
        if !self.needs_chunk() || self.active_chunks < self.chunks.len() {
            return Ok(());
        }
        if let Some(limit) = self.max_chunks {
            if self.chunks.len() >= limit {
                return Err(RuntimeError::PoolExhausted { limit });
            }
        }
        let chunk = Chunk::allocate(self.chunk_layout, self.chunk_capacity)?;
        self.chunks.push(chunk);
        Ok(())
    }

    /// Sets how many empty chunks are retained, freeing any excess now.
    pub fn set_reserved_empty_chunks(&mut self, count: usize) {
        self.reserved_limit = count;
        self.trim_reserved();
    }

    /// Base pointer and record count of an active chunk.
    ///
    /// The pointer stays valid until the pool is next mutated through
    /// `free` or `set_reserved_empty_chunks`.
    #[must_use]
    pub fn chunk_records(&self, chunk_index: usize) -> Option<(NonNull<u8>, usize)> {
        if chunk_index >= self.active_chunks {
            return None;
        }
        let chunk = &self.chunks[chunk_index];
        Some((chunk.data, chunk.len()))
    }

    /// Records held by each active chunk, in order.
    pub fn chunk_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks[..self.active_chunks].iter().map(Chunk::len)
    }

    /// Occupancy summary.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            records: self.records,
            active_chunks: self.active_chunks,
            reserved_chunks: self.chunks.len() - self.active_chunks,
            bytes_reserved: self.chunks.len() * self.chunk_layout.size(),
        }
    }

    fn locate(&self, handle: PoolHandle) -> RuntimeResult<(usize, usize)> {
        let stale = RuntimeError::StaleHandle {
            index: handle.index,
            generation: handle.generation,
        };
        let entry = self.slots.get(handle.index as usize).ok_or(stale.clone())?;
        match entry.location {
            Some((chunk, row)) if entry.generation == handle.generation => {
                Ok((chunk as usize, row as usize))
            }
            _ => Err(stale),
        }
    }

    #[inline]
    fn needs_chunk(&self) -> bool {
        self.active_chunks == 0 || self.chunks[self.active_chunks - 1].len() == self.chunk_capacity
    }

    fn trim_reserved(&mut self) {
        let keep = self.active_chunks + self.reserved_limit;
        if self.chunks.len() > keep {
            self.chunks.truncate(keep);
        }
    }
}
