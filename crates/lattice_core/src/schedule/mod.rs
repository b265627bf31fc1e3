//! # Dependency Graph Scheduler
//!
//! Runs systems over chunks once per frame, in parallel, respecting
//! explicit ordering hints and data conflicts.
//!
//! ## Design Philosophy
//!
//! - The graph is built once per system-set change, never per frame
//! - One job per matching chunk, pulled from a shared queue by busy-polling workers
//! - A node releases its successors only after its last job and hooks finish
//! - Empty or disabled nodes pass readiness through without stalling the graph
//!
//! ## Frame lifecycle
//!
//! ```text
//! Idle ──queue_layers──> Scheduled ──run_from_thread──> Running ──drop──> Idle
//! ```
//!
//! A queued [`FrameRun`] borrows the [`ComponentManager`] exclusively, so the
//! frame-boundary maintenance pass cannot overlap a run.

pub mod graph;
pub mod run;
pub mod system;

use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::RuntimeConfig;
use crate::ecs::{ComponentManager, FilterId};
use crate::error::{RuntimeError, RuntimeResult};

pub use graph::{Edge, EdgeKind, SystemGraph};
pub use run::{FrameRun, FrameStats};
pub use system::{FnSystem, System, SystemDescriptor};

/// Scheduler lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    /// No frame queued.
    Idle = 0,
    /// Jobs queued, no thread has started draining yet.
    Scheduled = 1,
    /// At least one thread is draining the frame.
    Running = 2,
}

impl SchedulerState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Scheduled,
            2 => Self::Running,
            _ => Self::Idle,
        }
    }
}

/// Owns the systems and their dependency graph.
pub struct Scheduler {
    systems: Vec<Box<dyn System>>,
    graph: SystemGraph,
    /// One filtering group per system, index-aligned with `systems`.
    filters: Vec<FilterId>,
    state: AtomicU8,
    worker_threads: usize,
}

impl Scheduler {
    /// Creates a scheduler with no systems.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            systems: Vec::new(),
            graph: SystemGraph::default(),
            filters: Vec::new(),
            state: AtomicU8::new(SchedulerState::Idle as u8),
            worker_threads: config.worker_threads,
        }
    }

    /// Replaces the system set and rebuilds the graph.
    ///
    /// Registers one filtering group per system, named after the system,
    /// over every component type it accesses.
    ///
    /// # Errors
    ///
    /// `DuplicateSystem` or `MissingRequiredSystem` from graph
    /// construction, `FilterConflict` if a filter with a system's name was
    /// registered with another component list. `SchedulerBusy` while a
    /// frame is queued.
    pub fn initialize_graph(
        &mut self,
        systems: Vec<Box<dyn System>>,
        manager: &ComponentManager,
    ) -> RuntimeResult<()> {
        if self.state() != SchedulerState::Idle {
            return Err(RuntimeError::SchedulerBusy);
        }

        let descriptors: Vec<_> = systems.iter().map(|s| s.descriptor()).collect();
        let graph = SystemGraph::build(&descriptors)?;
        let filters = descriptors
            .iter()
            .map(|d| manager.register_filter(d.name(), &d.components()))
            .collect::<RuntimeResult<Vec<_>>>()?;

        tracing::info!(
            systems = systems.len(),
            edges = graph.edges().len(),
            dropped = graph.dropped_edges().len(),
            "system graph initialized"
        );

        self.systems = systems;
        self.graph = graph;
        self.filters = filters;
        Ok(())
    }

    /// The current dependency graph.
    #[must_use]
    pub fn graph(&self) -> &SystemGraph {
        &self.graph
    }

    /// Filtering group of the system named `name`.
    #[must_use]
    pub fn filter_of(&self, name: &str) -> Option<FilterId> {
        self.graph.index_of(name).map(|index| self.filters[index])
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Queues one frame: collects every system's live and graveyard chunks
    /// and releases the nodes with no inputs.
    ///
    /// Threads then call [`FrameRun::run_from_thread`]; the scheduler returns
    /// to idle when the frame is dropped.
    ///
    /// # Errors
    ///
    /// `SchedulerBusy` if a frame is already queued or running.
    pub fn queue_layers<'w>(
        &'w self,
        manager: &'w mut ComponentManager,
    ) -> RuntimeResult<FrameRun<'w>> {
        self.state
            .compare_exchange(
                SchedulerState::Idle as u8,
                SchedulerState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| RuntimeError::SchedulerBusy)?;

        let manager: &'w ComponentManager = manager;
        match FrameRun::queue(self, manager) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.state
                    .store(SchedulerState::Idle as u8, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Queues a frame and drains it with the configured worker threads,
    /// the calling thread acting as main thread.
    ///
    /// # Errors
    ///
    /// Queueing errors, or the first error a system callback returned.
    pub fn run_frame(&self, manager: &mut ComponentManager) -> RuntimeResult<FrameStats> {
        let frame = self.queue_layers(manager)?;
        std::thread::scope(|scope| {
            for _ in 0..self.worker_threads {
                scope.spawn(|| frame.run_from_thread(false));
            }
            frame.run_from_thread(true);
        });
        frame.finish()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("systems", &self.graph.node_names())
            .field("state", &self.state())
            .field("worker_threads", &self.worker_threads)
            .finish_non_exhaustive()
    }
}
