// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # VOS - OS abstraction layer
//!
//! The small set of primitives the protocol engines are written against:
//! monotonic time, a bounded-block memory pool, a bounded queue, recursive
//! mutex and counting semaphore, time-based UUIDs, and socket helpers.
//!
//! Everything above this module is platform-free; porting the stack means
//! porting (at most) this module.

/// Bounded-block memory pool with power-of-two size classes.
pub mod mem;
/// Bounded FIFO queue.
pub mod queue;
/// UDP/TCP socket creation, options, multicast membership.
pub mod sock;
/// Recursive mutex and counting semaphore.
pub mod sync;
/// Monotonic clock and timeval arithmetic.
pub mod time;
/// RFC 4122 time-based UUIDs.
pub mod uuid;

pub use mem::{MemBlock, MemConfig, MemPool, MemStatistics};
pub use queue::VosQueue;
pub use sock::SocketOptions;
pub use sync::{SemaState, VosMutex, VosSemaphore};
pub use time::TimeVal;
pub use uuid::Uuid;
