//! # LATTICE Core Runtime
//!
//! Concurrent entity-component runtime:
//! - Chunked object pools with stable handles and swap-remove compaction
//! - Archetype storage with a one-frame graveyard for disposed groups
//! - Filtering groups resolved against every matching archetype
//! - A dependency-graph scheduler running per-chunk jobs on worker threads
//!
//! ## Architecture Rules
//!
//! 1. **Structural changes are staged** - applied only in the frame-boundary pass
//! 2. **Data-oriented design** - one contiguous column per component per chunk
//! 3. **No aliasing writes** - conflicting systems never run concurrently
//!
//! ## Example
//!
//! ```rust,ignore
//! use lattice_core::{ComponentManager, ComponentRegistry, RuntimeConfig, Scheduler};
//!
//! let registry = Arc::new(ComponentRegistry::builder().register::<Position>()?.build());
//! let config = RuntimeConfig::default();
//! let mut manager = ComponentManager::new(registry, config.clone());
//! let mut scheduler = Scheduler::new(&config);
//! scheduler.initialize_graph(systems, &manager)?;
//!
//! loop {
//!     manager.run_frame_boundary_maintenance()?;
//!     scheduler.run_frame(&mut manager)?;
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod ecs;
pub mod error;
pub mod memory;
pub mod schedule;

pub use config::RuntimeConfig;
pub use ecs::{
    Archetype, ArchetypeId, ArchetypeSignature, BufferLayout, ChunkView, Component,
    ComponentDescriptor, ComponentManager, ComponentRegistry, ComponentRegistryBuilder,
    ComponentTypeId, FilterId, GroupId, MaintenanceReport, StorageStats,
};
pub use error::{RuntimeError, RuntimeResult};
pub use memory::{ChunkedPool, PoolHandle, PoolStats, StoreHandle, StorePool};
pub use schedule::{
    Edge, EdgeKind, FnSystem, FrameRun, FrameStats, Scheduler, SchedulerState, System,
    SystemDescriptor, SystemGraph,
};
