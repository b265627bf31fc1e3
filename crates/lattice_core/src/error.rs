//! # Runtime Error Types
//!
//! All errors that can occur in the storage, filtering and scheduling layers.
//!
//! Caller-contract violations (stale handles, destroyed groups, components a
//! group does not carry) are reported as checked failures rather than
//! trusted blindly.

use thiserror::Error;

use crate::ecs::{ComponentTypeId, FilterId, GroupId};

/// Errors that can occur in the ECS runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A pool handle was freed, never issued, or belongs to another pool.
    #[error("stale handle: index {index}, generation {generation}")]
    StaleHandle {
        /// Slot index carried by the handle.
        index: u32,
        /// Generation carried by the handle.
        generation: u32,
    },

    /// The group id was never created or has already been flushed.
    #[error("unknown component group: {0:?}")]
    UnknownGroup(GroupId),

    /// The group's archetype does not contain the requested component.
    #[error("component {component:?} is not part of group {group:?}")]
    ComponentNotInGroup {
        /// The group that was queried.
        group: GroupId,
        /// The component type that was requested.
        component: ComponentTypeId,
    },

    /// The component type was never registered.
    #[error("component type {0:?} is not registered")]
    UnknownComponent(ComponentTypeId),

    /// Two registrations used the same component type id.
    #[error("component type {0:?} registered twice")]
    DuplicateComponent(ComponentTypeId),

    /// A component descriptor has an impossible layout.
    #[error("invalid layout for component {component:?}: {reason}")]
    InvalidLayout {
        /// The offending component type.
        component: ComponentTypeId,
        /// What is wrong with it.
        reason: String,
    },

    /// Typed access used a Rust type whose size does not match the registry.
    #[error("type mismatch for component {component:?}: registered {expected} bytes, accessed as {actual} bytes")]
    TypeMismatch {
        /// The component type being accessed.
        component: ComponentTypeId,
        /// Registered record size.
        expected: usize,
        /// Size of the Rust type used for access.
        actual: usize,
    },

    /// Mutable access to a column that is not writable in this view.
    #[error("column {0:?} is read-only in this view")]
    ReadOnlyColumn(ComponentTypeId),

    /// The column is not part of this view.
    #[error("column {0:?} is not part of this view")]
    MissingColumn(ComponentTypeId),

    /// The component is not buffered, so it owns no buffer store.
    #[error("component {0:?} is not buffered")]
    NotBuffered(ComponentTypeId),

    /// The filtering group id is unknown.
    #[error("unknown filtering group: {0:?}")]
    UnknownFilter(FilterId),

    /// A filtering group name was reused with a different component list.
    #[error("filtering group {0:?} already registered with a different component list")]
    FilterConflict(String),

    /// No group template with this name is registered.
    #[error("unknown group template: {0:?}")]
    UnknownTemplate(String),

    /// Two systems share a name.
    #[error("system {0:?} registered twice")]
    DuplicateSystem(String),

    /// A system requires another system that is not part of the graph.
    #[error("system {system:?} requires missing system {requires:?}")]
    MissingRequiredSystem {
        /// The system declaring the requirement.
        system: String,
        /// The missing system.
        requires: String,
    },

    /// A frame is already scheduled or running.
    #[error("scheduler busy: a frame is already scheduled or running")]
    SchedulerBusy,

    /// A pool reached its configured chunk limit.
    #[error("pool exhausted: limit of {limit} chunks reached")]
    PoolExhausted {
        /// The configured limit.
        limit: usize,
    },

    /// The allocator could not provide memory for a new chunk.
    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory {
        /// Size of the failed allocation.
        bytes: usize,
    },

    /// Invalid configuration file or value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
