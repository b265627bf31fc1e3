//! # Runtime Benchmark
//!
//! Measures the hot paths of a frame:
//! 1. Pool churn - allocate/free with swap-remove compaction
//! 2. Chunk iteration - typed column access through filtering groups
//! 3. Scheduled frames - full graph run over 100K groups on worker threads

#![allow(missing_docs)]
#![allow(dead_code)]

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lattice_core::{
    ChunkedPool, Component, ComponentManager, ComponentRegistry, ComponentTypeId, FnSystem,
    RuntimeConfig, Scheduler, System, SystemDescriptor,
};

const GROUP_COUNT: usize = 100_000;

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

impl Component for Position {
    const ID: ComponentTypeId = ComponentTypeId::new(1);
    const NAME: &'static str = "Position";
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

impl Component for Velocity {
    const ID: ComponentTypeId = ComponentTypeId::new(2);
    const NAME: &'static str = "Velocity";
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct Heat {
    value: f32,
}

impl Component for Heat {
    const ID: ComponentTypeId = ComponentTypeId::new(3);
    const NAME: &'static str = "Heat";
}

/// Generate deterministic "random" indices
fn generate_random_indices(count: usize, max: usize, seed: u64) -> Vec<usize> {
    let mut indices = Vec::with_capacity(count);
    let mut state = seed;

    for _ in 0..count {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        indices.push((state as usize) % max);
    }

    indices
}

fn populated_manager() -> ComponentManager {
    let registry = ComponentRegistry::builder()
        .register::<Position>()
        .unwrap()
        .register::<Velocity>()
        .unwrap()
        .register::<Heat>()
        .unwrap()
        .build();
    let config = RuntimeConfig {
        chunk_capacity: 128,
        ..RuntimeConfig::default()
    };
    let manager = ComponentManager::new(Arc::new(registry), config);
    for i in 0..GROUP_COUNT {
        // Two archetypes so filters span more than one.
        let types: &[ComponentTypeId] = if i % 4 == 0 {
            &[Position::ID, Velocity::ID, Heat::ID]
        } else {
            &[Position::ID, Velocity::ID]
        };
        manager.create_group(types).unwrap();
    }
    manager
}

// =============================================================================
// POOL BENCHMARKS
// =============================================================================

fn bench_pool_churn(c: &mut Criterion) {
    let mut pool = ChunkedPool::new(16, 8, 128, 2, None).unwrap();
    let mut handles: Vec<_> = (0..GROUP_COUNT).map(|_| pool.allocate().unwrap()).collect();
    let victims = generate_random_indices(1_000, GROUP_COUNT, 0xDEAD_BEEF);

    c.bench_function("pool_free_allocate_1K_of_100K", |b| {
        b.iter(|| {
            for &victim in &victims {
                pool.free(handles[victim]).unwrap();
                handles[victim] = pool.allocate().unwrap();
            }
            black_box(pool.len())
        });
    });
}

// =============================================================================
// ITERATION BENCHMARKS
// =============================================================================

fn bench_chunk_iteration(c: &mut Criterion) {
    let mut manager = populated_manager();
    let filter = manager
        .register_filter("integrate", &[Position::ID, Velocity::ID])
        .unwrap();

    c.bench_function("chunk_integrate_100K", |b| {
        b.iter(|| {
            for mut view in manager.query_filtering_group_mut(filter, false).unwrap() {
                let (velocity, position) = view.read_write::<Velocity, Position>().unwrap();
                for (p, v) in position.iter_mut().zip(velocity) {
                    p.x += v.x * 0.016;
                    p.y += v.y * 0.016;
                    p.z += v.z * 0.016;
                }
            }
        });
    });
}

// =============================================================================
// SCHEDULER BENCHMARKS
// =============================================================================

fn bench_scheduled_frame(c: &mut Criterion) {
    let mut manager = populated_manager();
    let config = RuntimeConfig::default();
    let mut scheduler = Scheduler::new(&config);

    let systems: Vec<Box<dyn System>> = vec![
        Box::new(FnSystem::new(
            SystemDescriptor::new("integrate")
                .reads(&[Velocity::ID])
                .writes(&[Position::ID]),
            |chunk| {
                let (velocity, position) = chunk.read_write::<Velocity, Position>()?;
                for (p, v) in position.iter_mut().zip(velocity) {
                    p.x += v.x * 0.016;
                }
                Ok(())
            },
        )),
        Box::new(FnSystem::new(
            SystemDescriptor::new("cool").writes(&[Heat::ID]),
            |chunk| {
                for h in chunk.column_mut::<Heat>()? {
                    h.value *= 0.99;
                }
                Ok(())
            },
        )),
        Box::new(FnSystem::new(
            SystemDescriptor::new("bounds")
                .reads(&[Position::ID])
                .runs_after("integrate"),
            |chunk| {
                black_box(chunk.column::<Position>()?.len());
                Ok(())
            },
        )),
    ];
    scheduler.initialize_graph(systems, &manager).unwrap();

    c.bench_function("scheduled_frame_3_systems_100K", |b| {
        b.iter(|| black_box(scheduler.run_frame(&mut manager).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_pool_churn,
    bench_chunk_iteration,
    bench_scheduled_frame,
);

criterion_main!(benches);
