//! # Memory Management
//!
//! Chunked record pools and out-of-line store pools.
//!
//! ## Design Philosophy
//!
//! - Records live in fixed-capacity chunks that never move once allocated
//! - Handles are generational, so stale handles fail instead of aliasing
//! - Removal compacts with swap-and-pop, keeping iteration dense

pub mod chunked;
pub mod pool;

pub use chunked::{ChunkedPool, PoolHandle, PoolStats};
pub use pool::{StoreHandle, StorePool};
