//! # Systems
//!
//! A system is per-chunk logic plus a [`SystemDescriptor`] declaring which
//! component types it touches and how it must be ordered against others.
//!
//! The scheduler never hands a system the whole world. Each job is one
//! [`ChunkView`] whose columns are writable only for the types the system
//! writes outside its read-only set.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::ecs::{ChunkView, ComponentTypeId};
use crate::error::RuntimeResult;

/// Static metadata of a system.
///
/// # Example
///
/// ```rust,ignore
/// let movement = SystemDescriptor::new("movement")
///     .reads(&[Velocity::ID])
///     .writes(&[Position::ID])
///     .runs_after("input");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemDescriptor {
    name: String,
    reads: Vec<ComponentTypeId>,
    writes: Vec<ComponentTypeId>,
    read_only: Vec<ComponentTypeId>,
    runs_before: Vec<String>,
    runs_after: Vec<String>,
    requires: Vec<String>,
    main_thread_only: bool,
    post_update_slices: usize,
}

impl SystemDescriptor {
    /// Starts a descriptor. The name keys the system in the graph.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declares component types read.
    #[must_use]
    pub fn reads(mut self, types: &[ComponentTypeId]) -> Self {
        self.reads.extend_from_slice(types);
        self
    }

    /// Declares component types written.
    #[must_use]
    pub fn writes(mut self, types: &[ComponentTypeId]) -> Self {
        self.writes.extend_from_slice(types);
        self
    }

    /// Declares types that are never written even if listed in `writes`.
    #[must_use]
    pub fn read_only(mut self, types: &[ComponentTypeId]) -> Self {
        self.read_only.extend_from_slice(types);
        self
    }

    /// This system must finish before `system` starts.
    #[must_use]
    pub fn runs_before(mut self, system: impl Into<String>) -> Self {
        self.runs_before.push(system.into());
        self
    }

    /// This system must start after `system` finishes.
    #[must_use]
    pub fn runs_after(mut self, system: impl Into<String>) -> Self {
        self.runs_after.push(system.into());
        self
    }

    /// Like [`SystemDescriptor::runs_after`], but graph construction fails
    /// if `system` is absent.
    #[must_use]
    pub fn requires(mut self, system: impl Into<String>) -> Self {
        self.requires.push(system.into());
        self
    }

    /// Routes every job of this system to the main thread.
    #[must_use]
    pub fn main_thread_only(mut self, main_thread_only: bool) -> Self {
        self.main_thread_only = main_thread_only;
        self
    }

    /// Number of parallel post-update slices run after the after hook.
    #[must_use]
    pub fn post_update_slices(mut self, slices: usize) -> Self {
        self.post_update_slices = slices;
        self
    }

    /// Returns the name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Systems this one runs before.
    #[must_use]
    pub fn before(&self) -> &[String] {
        &self.runs_before
    }

    /// Systems this one runs after.
    #[must_use]
    pub fn after(&self) -> &[String] {
        &self.runs_after
    }

    /// Systems that must exist and run first.
    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.requires
    }

    /// Checks main-thread affinity.
    #[inline]
    #[must_use]
    pub const fn is_main_thread_only(&self) -> bool {
        self.main_thread_only
    }

    /// Post-update slice count.
    #[inline]
    #[must_use]
    pub const fn slices(&self) -> usize {
        self.post_update_slices
    }

    /// Every type accessed, reads first, without duplicates.
    ///
    /// This is the component list of the system's filtering group.
    #[must_use]
    pub fn components(&self) -> Vec<ComponentTypeId> {
        let mut components = Vec::with_capacity(self.reads.len() + self.writes.len());
        for &ty in self.reads.iter().chain(&self.writes) {
            if !components.contains(&ty) {
                components.push(ty);
            }
        }
        components
    }

    /// Types actually written: `writes` minus `read_only`.
    #[must_use]
    pub fn writable(&self) -> Vec<ComponentTypeId> {
        let mut writable: Vec<ComponentTypeId> = self
            .writes
            .iter()
            .copied()
            .filter(|ty| !self.read_only.contains(ty))
            .collect();
        writable.sort_unstable();
        writable.dedup();
        writable
    }

    /// Checks whether chunk jobs of the two systems could alias memory:
    /// they share a type and at least one of them writes it.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        let ours = self.components();
        let theirs = other.components();
        self.writable().iter().any(|ty| theirs.contains(ty))
            || other.writable().iter().any(|ty| ours.contains(ty))
    }
}

/// Per-chunk logic driven by the scheduler.
///
/// Every callback may run on any worker thread unless the descriptor asks
/// for the main thread. `update_chunk` and `dispose_chunk` run concurrently
/// for different chunks of the same system.
pub trait System: Send + Sync {
    /// Static metadata.
    fn descriptor(&self) -> &SystemDescriptor;

    /// Processes one live chunk.
    ///
    /// # Errors
    ///
    /// Any error is reported by the frame once it has drained.
    fn update_chunk(&self, chunk: &mut ChunkView<'_>) -> RuntimeResult<()>;

    /// Processes one graveyard chunk (groups disposed at the last pass).
    ///
    /// # Errors
    ///
    /// Any error is reported by the frame once it has drained.
    fn dispose_chunk(&self, _chunk: &mut ChunkView<'_>) -> RuntimeResult<()> {
        Ok(())
    }

    /// Runs once, after the last chunk job of the frame.
    ///
    /// # Errors
    ///
    /// Any error is reported by the frame once it has drained.
    fn after_update(&self) -> RuntimeResult<()> {
        Ok(())
    }

    /// Runs once per slice, in parallel, after [`System::after_update`].
    ///
    /// # Errors
    ///
    /// Any error is reported by the frame once it has drained.
    fn post_update(&self, _slice: usize, _slices: usize) -> RuntimeResult<()> {
        Ok(())
    }

    /// Disabled systems contribute no jobs this frame but still release
    /// their successors.
    fn is_enabled(&self) -> bool {
        true
    }
}

type ChunkFn = dyn Fn(&mut ChunkView<'_>) -> RuntimeResult<()> + Send + Sync;
type HookFn = dyn Fn() -> RuntimeResult<()> + Send + Sync;
type SliceFn = dyn Fn(usize, usize) -> RuntimeResult<()> + Send + Sync;

/// A [`System`] backed by closures.
///
/// # Example
///
/// ```rust,ignore
/// let gravity = FnSystem::new(
///     SystemDescriptor::new("gravity").writes(&[Velocity::ID]),
///     |chunk| {
///         for v in chunk.column_mut::<Velocity>()? {
///             v.y -= 9.81 * DT;
///         }
///         Ok(())
///     },
/// );
/// ```
pub struct FnSystem<F>
where
    F: Fn(&mut ChunkView<'_>) -> RuntimeResult<()> + Send + Sync,
{
    descriptor: SystemDescriptor,
    update: F,
    dispose: Option<Box<ChunkFn>>,
    after: Option<Box<HookFn>>,
    post: Option<Box<SliceFn>>,
    enabled: AtomicBool,
}

impl<F> FnSystem<F>
where
    F: Fn(&mut ChunkView<'_>) -> RuntimeResult<()> + Send + Sync,
{
    /// Creates a system from its per-chunk update.
    pub fn new(descriptor: SystemDescriptor, update: F) -> Self {
        Self {
            descriptor,
            update,
            dispose: None,
            after: None,
            post: None,
            enabled: AtomicBool::new(true),
        }
    }

    /// Sets the graveyard-chunk callback.
    #[must_use]
    pub fn on_dispose(
        mut self,
        dispose: impl Fn(&mut ChunkView<'_>) -> RuntimeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.dispose = Some(Box::new(dispose));
        self
    }

    /// Sets the after-update hook.
    #[must_use]
    pub fn on_after_update(
        mut self,
        after: impl Fn() -> RuntimeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.after = Some(Box::new(after));
        self
    }

    /// Sets the post-update slice callback.
    #[must_use]
    pub fn on_post_update(
        mut self,
        post: impl Fn(usize, usize) -> RuntimeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.post = Some(Box::new(post));
        self
    }

    /// Enables or disables the system for subsequent frames.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl<F> System for FnSystem<F>
where
    F: Fn(&mut ChunkView<'_>) -> RuntimeResult<()> + Send + Sync,
{
    fn descriptor(&self) -> &SystemDescriptor {
        &self.descriptor
    }

    fn update_chunk(&self, chunk: &mut ChunkView<'_>) -> RuntimeResult<()> {
        (self.update)(chunk)
    }

    fn dispose_chunk(&self, chunk: &mut ChunkView<'_>) -> RuntimeResult<()> {
        self.dispose.as_ref().map_or(Ok(()), |dispose| dispose(chunk))
    }

    fn after_update(&self) -> RuntimeResult<()> {
        self.after.as_ref().map_or(Ok(()), |after| after())
    }

    fn post_update(&self, slice: usize, slices: usize) -> RuntimeResult<()> {
        self.post.as_ref().map_or(Ok(()), |post| post(slice, slices))
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITION: ComponentTypeId = ComponentTypeId::new(1);
    const VELOCITY: ComponentTypeId = ComponentTypeId::new(2);
    const MESH: ComponentTypeId = ComponentTypeId::new(3);

    #[test]
    fn test_components_dedup_in_order() {
        let d = SystemDescriptor::new("s")
            .reads(&[VELOCITY, POSITION])
            .writes(&[POSITION, MESH]);
        assert_eq!(d.components(), vec![VELOCITY, POSITION, MESH]);
    }

    #[test]
    fn test_read_only_masks_writes() {
        let d = SystemDescriptor::new("s")
            .writes(&[POSITION, MESH])
            .read_only(&[MESH]);
        assert_eq!(d.writable(), vec![POSITION]);
    }

    #[test]
    fn test_conflicts() {
        let writer = SystemDescriptor::new("a").writes(&[POSITION]);
        let reader = SystemDescriptor::new("b").reads(&[POSITION]);
        let other = SystemDescriptor::new("c").writes(&[VELOCITY]);
        let masked = SystemDescriptor::new("d")
            .writes(&[POSITION])
            .read_only(&[POSITION]);

        assert!(writer.conflicts_with(&reader));
        assert!(reader.conflicts_with(&writer));
        assert!(!writer.conflicts_with(&other));
        assert!(!reader.conflicts_with(&masked));
        assert!(writer.conflicts_with(&masked));
    }

    #[test]
    fn test_fn_system_hooks() {
        let system = FnSystem::new(SystemDescriptor::new("s"), |_| Ok(()))
            .on_after_update(|| Err(crate::error::RuntimeError::SchedulerBusy));
        assert!(system.after_update().is_err());
        assert!(system.post_update(0, 1).is_ok());

        assert!(system.is_enabled());
        system.set_enabled(false);
        assert!(!system.is_enabled());
    }
}
