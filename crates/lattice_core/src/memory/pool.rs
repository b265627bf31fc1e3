//! # Store Pool
//!
//! Free-list allocator for the out-of-line byte stores owned by buffered
//! components.

use bytemuck::{Pod, Zeroable};

use crate::error::{RuntimeError, RuntimeResult};

/// Handle to a buffer store.
///
/// Buffered components embed this 8-byte header in their record at the
/// offset declared in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct StoreHandle {
    /// Index into the pool.
    index: u32,
    /// Generation of the slot when the store was created.
    generation: u32,
}

impl StoreHandle {
    /// Size of the header embedded in component records.
    pub const SIZE: usize = std::mem::size_of::<Self>();

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

    /// Reads a header from record bytes.
    #[inline]
    #[must_use]
    pub fn read(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..Self::SIZE])
    }

    /// Writes the header into record bytes.
    #[inline]
    pub fn write(self, bytes: &mut [u8]) {
        bytes[..Self::SIZE].copy_from_slice(bytemuck::bytes_of(&self));
    }
}

/// A pool allocator for byte stores.
///
/// Slots are recycled through a free list. Every slot carries a generation
/// that is bumped on release, so a header copied out of a freed record can
/// never reach the next store placed in that slot.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. The component manager wraps it in a mutex.
///
/// # Example
///
/// ```rust,ignore
/// let mut pool = StorePool::new(1024);
/// let handle = pool.allocate(64)?;
/// pool.get_mut(handle).unwrap().extend_from_slice(b"mesh");
/// pool.release(handle);
/// ```
#[derive(Debug, Default)]
pub struct StorePool {
    /// The store slots.
    storage: Vec<Option<Vec<u8>>>,
    /// Generation per slot.
    generations: Vec<u32>,
    /// Free list - indices of available slots.
    free_list: Vec<u32>,
    /// Number of allocated stores.
    allocated_count: usize,
    /// Maximum number of stores.
    capacity: usize,
}

impl StorePool {
    /// Creates a new pool that can hold up to `capacity` stores.
    ///
    /// Slots are created on demand.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Returns the maximum number of stores.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of currently allocated stores.
    #[inline]
    #[must_use]
    pub const fn allocated_count(&self) -> usize {
        self.allocated_count
    }

    /// Allocates a zero-filled store of `len` bytes.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` when the pool already holds `capacity` stores.
    pub fn allocate(&mut self, len: usize) -> RuntimeResult<StoreHandle> {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                if self.storage.len() >= self.capacity {
                    return Err(RuntimeError::PoolExhausted {
                        limit: self.capacity,
                    });
                }
                let index = u32::try_from(self.storage.len()).map_err(|_| {
                    RuntimeError::PoolExhausted {
                        limit: self.capacity,
                    }
                })?;
                self.storage.push(None);
                self.generations.push(0);
                index
            }
        };

        self.storage[index as usize] = Some(vec![0; len]);
        self.allocated_count += 1;

        Ok(StoreHandle {
            index,
            generation: self.generations[index as usize],
        })
    }

    /// Releases a store.
    ///
    /// # Returns
    ///
    /// The released bytes, or None if the handle was stale.
    pub fn release(&mut self, handle: StoreHandle) -> Option<Vec<u8>> {
        if !self.is_current(handle) {
            return None;
        }
        let value = self.storage[handle.index as usize].take()?;
        self.generations[handle.index as usize] =
            self.generations[handle.index as usize].wrapping_add(1);
        self.free_list.push(handle.index);
        self.allocated_count -= 1;
        Some(value)
    }

    /// Gets a store.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: StoreHandle) -> Option<&Vec<u8>> {
        if !self.is_current(handle) {
            return None;
        }
        self.storage.get(handle.index as usize)?.as_ref()
    }

    /// Gets a store for writing.
    #[inline]
    pub fn get_mut(&mut self, handle: StoreHandle) -> Option<&mut Vec<u8>> {
        if !self.is_current(handle) {
            return None;
        }
        self.storage.get_mut(handle.index as usize)?.as_mut()
    }

    fn is_current(&self, handle: StoreHandle) -> bool {
        self.generations.get(handle.index as usize) == Some(&handle.generation)
    }
}
