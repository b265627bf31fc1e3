//! # Frame Execution
//!
//! A [`FrameRun`] is one frame of queued work. Every participating thread
//! calls [`FrameRun::run_from_thread`]; the call returns once every node of
//! the graph has completed.
//!
//! ## Protocol
//!
//! ```text
//!            release(node)
//!                 │
//!      enabled and has chunks? ──no──> complete(node)
//!                 │ yes
//!      in_flight = jobs; enqueue jobs
//!                 │
//!      worker: run job; in_flight -= 1
//!                 │ reached zero
//!      completion lock: after_update, enqueue post-update slices
//!                 │ last slice done (or none)
//!      complete(node): unsatisfied -= 1 on successors, release those at zero
//! ```
//!
//! Workers poll the queues without blocking and yield when both are empty.
//! Jobs of main-thread-only systems go to a queue only the main thread
//! drains.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::{Scheduler, SchedulerState};
use crate::ecs::{ChunkView, ComponentManager};
use crate::error::{RuntimeError, RuntimeResult};

/// Counters for one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Chunk and post-update jobs executed.
    pub jobs: usize,
    /// Nodes that had work this frame.
    pub nodes_run: usize,
    /// Nodes passed through (disabled or without chunks).
    pub nodes_skipped: usize,
    /// Post-update slices queued.
    pub post_update_slices: usize,
}

enum JobKind<'w> {
    Update(ChunkView<'w>),
    Dispose(ChunkView<'w>),
    PostUpdate(usize),
}

struct Job<'w> {
    node: usize,
    kind: JobKind<'w>,
}

struct NodeState<'w> {
    unsatisfied: AtomicUsize,
    in_flight: AtomicUsize,
    /// Serializes the "last job finished" transition.
    completion: Mutex<()>,
    /// Chunk jobs collected at queue time, taken on release.
    jobs: Mutex<Vec<Job<'w>>>,
}

/// Sets the poison flag if a system panics while running a job.
struct PanicGuard<'a>(&'a AtomicBool);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

/// One queued frame.
///
/// Holds the component manager borrowed for the whole frame, so storage
/// cannot be mutated until the frame is dropped.
pub struct FrameRun<'w> {
    scheduler: &'w Scheduler,
    nodes: Vec<NodeState<'w>>,
    shared_tx: Sender<Job<'w>>,
    shared_rx: Receiver<Job<'w>>,
    main_tx: Sender<Job<'w>>,
    main_rx: Receiver<Job<'w>>,
    remaining: AtomicUsize,
    busy: AtomicUsize,
    poisoned: AtomicBool,
    error: Mutex<Option<RuntimeError>>,
    jobs_run: AtomicUsize,
    nodes_run: AtomicUsize,
    nodes_skipped: AtomicUsize,
    post_slices: AtomicUsize,
}

impl<'w> FrameRun<'w> {
    /// Collects every node's chunk views and releases the root nodes.
    pub(super) fn queue(
        scheduler: &'w Scheduler,
        manager: &'w ComponentManager,
    ) -> RuntimeResult<Self> {
        let graph = &scheduler.graph;
        let mut nodes = Vec::with_capacity(graph.len());
        let mut queued_jobs = 0;

        let pairs = scheduler.systems.iter().zip(&scheduler.filters);
        for (index, (system, &filter)) in pairs.enumerate() {
            let writable = system.descriptor().writable();
            let mut jobs: Vec<Job<'w>> = manager
                .chunk_views(filter, false, &writable)?
                .into_iter()
                .map(|view| Job {
                    node: index,
                    kind: JobKind::Update(view),
                })
                .collect();
            jobs.extend(
                manager
                    .chunk_views(filter, true, &writable)?
                    .into_iter()
                    .map(|view| Job {
                        node: index,
                        kind: JobKind::Dispose(view),
                    }),
            );
            queued_jobs += jobs.len();

            nodes.push(NodeState {
                unsatisfied: AtomicUsize::new(graph.inputs(index).len()),
                in_flight: AtomicUsize::new(0),
                completion: Mutex::new(()),
                jobs: Mutex::new(jobs),
            });
        }

        let (shared_tx, shared_rx) = unbounded();
        let (main_tx, main_rx) = unbounded();
        let frame = Self {
            scheduler,
            nodes,
            shared_tx,
            shared_rx,
            main_tx,
            main_rx,
            remaining: AtomicUsize::new(graph.len()),
            busy: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
            error: Mutex::new(None),
            jobs_run: AtomicUsize::new(0),
            nodes_run: AtomicUsize::new(0),
            nodes_skipped: AtomicUsize::new(0),
            post_slices: AtomicUsize::new(0),
        };

        let roots: Vec<usize> = (0..graph.len())
            .filter(|&node| graph.inputs(node).is_empty())
            .collect();
        frame.release(roots);

        tracing::debug!(
            nodes = graph.len(),
            chunk_jobs = queued_jobs,
            "frame queued"
        );
        Ok(frame)
    }

    /// Drains jobs until every node has completed.
    ///
    /// Call once per participating thread. Only the main thread
    /// (`is_main = true`) runs jobs of main-thread-only systems.
    pub fn run_from_thread(&self, is_main: bool) {
        let _ = self.scheduler.state.compare_exchange(
            SchedulerState::Scheduled as u8,
            SchedulerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        loop {
            if self.is_finished() || self.poisoned.load(Ordering::Acquire) {
                break;
            }
            let job = if is_main {
                self.main_rx
                    .try_recv()
                    .or_else(|_| self.shared_rx.try_recv())
                    .ok()
            } else {
                self.shared_rx.try_recv().ok()
            };

            match job {
                Some(job) => {
                    self.busy.fetch_add(1, Ordering::AcqRel);
                    let guard = PanicGuard(&self.poisoned);
                    self.execute(job);
                    drop(guard);
                    self.busy.fetch_sub(1, Ordering::AcqRel);
                }
                None => std::thread::yield_now(),
            }
        }
    }

    /// Threads currently running a job.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Checks whether every node has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Drains any remaining work on the calling thread and reports the frame.
    ///
    /// # Errors
    ///
    /// The first error returned by a system callback this frame.
    pub fn finish(self) -> RuntimeResult<FrameStats> {
        self.run_from_thread(true);
        if let Some(err) = self.error.lock().take() {
            return Err(err);
        }
        let stats = FrameStats {
            jobs: self.jobs_run.load(Ordering::Acquire),
            nodes_run: self.nodes_run.load(Ordering::Acquire),
            nodes_skipped: self.nodes_skipped.load(Ordering::Acquire),
            post_update_slices: self.post_slices.load(Ordering::Acquire),
        };
        tracing::debug!(
            jobs = stats.jobs,
            nodes_run = stats.nodes_run,
            nodes_skipped = stats.nodes_skipped,
            "frame finished"
        );
        Ok(stats)
    }

    fn execute(&self, job: Job<'w>) {
        let system = &*self.scheduler.systems[job.node];
        let after_post = matches!(job.kind, JobKind::PostUpdate(_));
        let result = match job.kind {
            JobKind::Update(mut view) => system.update_chunk(&mut view),
            JobKind::Dispose(mut view) => system.dispose_chunk(&mut view),
            JobKind::PostUpdate(slice) => system.post_update(slice, system.descriptor().slices()),
        };
        self.jobs_run.fetch_add(1, Ordering::Relaxed);
        self.record(job.node, result);

        if self.nodes[job.node].in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish_node(job.node, after_post);
        }
    }

    /// Runs after the last job of a node's current stage.
    fn finish_node(&self, node: usize, after_post: bool) {
        let state = &self.nodes[node];
        let completion = state.completion.lock();

        if !after_post {
            let system = &*self.scheduler.systems[node];
            self.record(node, system.after_update());

            let slices = system.descriptor().slices();
            if slices > 0 {
                state.in_flight.store(slices, Ordering::Release);
                self.post_slices.fetch_add(slices, Ordering::Relaxed);
                for slice in 0..slices {
                    self.enqueue(Job {
                        node,
                        kind: JobKind::PostUpdate(slice),
                    });
                }
                return;
            }
        }
        drop(completion);

        let mut ready = Vec::new();
        self.release_successors(node, &mut ready);
        self.release(ready);
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    /// Enqueues the jobs of every ready node; empty or disabled nodes
    /// complete immediately and forward readiness to their successors.
    fn release(&self, mut worklist: Vec<usize>) {
        while let Some(node) = worklist.pop() {
            let system = &*self.scheduler.systems[node];
            let jobs = std::mem::take(&mut *self.nodes[node].jobs.lock());

            if jobs.is_empty() || !system.is_enabled() {
                self.nodes_skipped.fetch_add(1, Ordering::Relaxed);
                self.release_successors(node, &mut worklist);
                self.remaining.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            self.nodes_run.fetch_add(1, Ordering::Relaxed);
            self.nodes[node].in_flight.store(jobs.len(), Ordering::Release);
            for job in jobs {
                self.enqueue(job);
            }
        }
    }

    fn release_successors(&self, node: usize, worklist: &mut Vec<usize>) {
        for &next in self.scheduler.graph.outputs(node) {
            if self.nodes[next].unsatisfied.fetch_sub(1, Ordering::AcqRel) == 1 {
                worklist.push(next);
            }
        }
    }

    fn enqueue(&self, job: Job<'w>) {
        let job_node = job.node;
        let queue = if self.scheduler.systems[job_node].descriptor().is_main_thread_only() {
            &self.main_tx
        } else {
            &self.shared_tx
        };
        if queue.send(job).is_err() {
            // Receivers live in `self`; a lost job would hang the frame.
            tracing::error!(node = job_node, "job queue disconnected");
            self.poisoned.store(true, Ordering::Release);
        }
    }

    fn record(&self, node: usize, result: RuntimeResult<()>) {
        if let Err(err) = result {
            tracing::warn!(
                system = self.scheduler.graph.node_names()[node].as_str(),
                error = %err,
                "system callback failed"
            );
            self.error.lock().get_or_insert(err);
        }
    }
}

impl Drop for FrameRun<'_> {
    fn drop(&mut self) {
        self.scheduler
            .state
            .store(SchedulerState::Idle as u8, Ordering::Release);
    }
}
