//! # Entity Component System
//!
//! Archetype storage for component groups, plus the filtering index the
//! scheduler queries every frame.
//!
//! ## Design Philosophy
//!
//! - Components are plain bytes described once by an immutable registry
//! - Groups with the same component set share one archetype
//! - Each archetype stores one chunked pool per component, index-aligned
//! - Structural changes are staged and applied between frames

pub mod archetype;
pub mod component;
pub mod entity;
pub mod filter;
pub mod manager;

pub use archetype::{Archetype, ArchetypeId, ArchetypeSignature};
pub use component::{
    BufferLayout, Component, ComponentDescriptor, ComponentRegistry, ComponentRegistryBuilder,
    ComponentTypeId,
};
pub use entity::GroupId;
pub use filter::{ChunkView, FilterId};
pub use manager::{ComponentManager, MaintenanceReport, StorageStats};
