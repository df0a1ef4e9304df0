// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded-block memory pool with power-of-two size classes.
//!
//! Fifteen classes from 32 B to 512 KiB serve all engine buffers. A request
//! takes the smallest class that fits (request rounded up to 4 bytes); a
//! freed block returns to the free list of the class it was carved for and
//! is recycled from there. When the uncarved budget is exhausted, a larger
//! class's free list may satisfy the request at the cost of a logged waste
//! event. Initialising with a zero budget switches the pool to plain heap
//! passthrough.
//!
//! Pre-seeding a count of blocks per class at init time is supported and
//! recommended for long-running nodes, so the large classes exist before
//! the budget tail has been nibbled away by small telegrams.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::api::{Error, Result};

/// Number of size classes.
pub const NUM_BLOCK_SIZES: usize = 15;

/// Block size per class, ascending powers of two.
pub const BLOCK_SIZES: [usize; NUM_BLOCK_SIZES] = [
    32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072, 262144, 524288,
];

/// Default pre-allocation per class: a few mid-size blocks so MD telegrams
/// never lose the race for budget against small PD frames.
pub const DEFAULT_PREALLOC: [u32; NUM_BLOCK_SIZES] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 4, 0, 0];

/// Pool configuration handed to `Session::open`.
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Total byte budget; `0` selects heap passthrough.
    pub total_size: usize,
    /// Blocks to pre-carve per size class.
    pub prealloc: [u32; NUM_BLOCK_SIZES],
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            total_size: 0,
            prealloc: [0; NUM_BLOCK_SIZES],
        }
    }
}

impl MemConfig {
    /// Bounded pool with the recommended pre-allocation table.
    pub fn bounded(total_size: usize) -> Self {
        MemConfig {
            total_size,
            prealloc: DEFAULT_PREALLOC,
        }
    }
}

/// Counter snapshot of a pool, mirroring the wire statistics block.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemStatistics {
    /// Configured budget (`0` in heap mode).
    pub total: usize,
    /// Bytes currently not backing a live allocation.
    pub free: usize,
    /// Low-watermark of `free` since init.
    pub min_free: usize,
    /// Live allocations per class.
    pub num_alloc: [u32; NUM_BLOCK_SIZES],
    /// Blocks carved per class since init.
    pub carved: [u32; NUM_BLOCK_SIZES],
    /// Failed allocations.
    pub alloc_errors: u32,
    /// Double frees or foreign frees (cannot occur through [`MemBlock`]).
    pub free_errors: u32,
}

struct PoolState {
    free_lists: [Vec<Box<[u8]>>; NUM_BLOCK_SIZES],
    /// Bytes never carved into any class yet.
    unclaimed: usize,
    free: usize,
    min_free: usize,
    num_alloc: [u32; NUM_BLOCK_SIZES],
    carved: [u32; NUM_BLOCK_SIZES],
    alloc_errors: u32,
    free_errors: u32,
}

struct PoolInner {
    state: Mutex<PoolState>,
    total: usize,
    heap_mode: bool,
}

/// Shared handle to a bounded-block pool. Cheap to clone.
#[derive(Clone)]
pub struct MemPool {
    inner: Arc<PoolInner>,
}

/// An allocated block. Dereferences to exactly the requested length; the
/// backing buffer is the full class size and returns to its class on drop.
pub struct MemBlock {
    buf: Option<Box<[u8]>>,
    class: usize,
    len: usize,
    pool: Arc<PoolInner>,
}

/// Smallest class index whose block size covers `rounded`, if any.
fn class_for(rounded: usize) -> Option<usize> {
    BLOCK_SIZES.iter().position(|&s| s >= rounded)
}

impl MemPool {
    /// Create a pool from its configuration, pre-carving the requested
    /// blocks. Fails with `Mem` if the pre-allocation table alone exceeds
    /// the budget.
    pub fn new(cfg: &MemConfig) -> Result<Self> {
        let heap_mode = cfg.total_size == 0;
        let pool = MemPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free_lists: std::array::from_fn(|_| Vec::new()),
                    unclaimed: cfg.total_size,
                    free: cfg.total_size,
                    min_free: cfg.total_size,
                    num_alloc: [0; NUM_BLOCK_SIZES],
                    carved: [0; NUM_BLOCK_SIZES],
                    alloc_errors: 0,
                    free_errors: 0,
                }),
                total: cfg.total_size,
                heap_mode,
            }),
        };

        if !heap_mode {
            // Pre-seed: allocate then drop, leaving the blocks on their
            // class free lists with the budget already carved.
            let mut held = Vec::new();
            for (class, &count) in cfg.prealloc.iter().enumerate() {
                for _ in 0..count {
                    held.push(pool.alloc(BLOCK_SIZES[class])?);
                }
            }
            drop(held);
            log::debug!(
                "[VOS] mem pool ready: budget={} prealloc classes seeded",
                cfg.total_size
            );
        }

        Ok(pool)
    }

    /// Allocate at least `size` bytes. See the module docs for the class
    /// selection and fallback rules.
    pub fn alloc(&self, size: usize) -> Result<MemBlock> {
        if size == 0 {
            return Err(Error::Param("zero-size allocation".into()));
        }
        let rounded = (size + 3) & !3;

        if self.inner.heap_mode {
            let class = class_for(rounded).unwrap_or(NUM_BLOCK_SIZES - 1);
            let mut st = self.inner.state.lock();
            st.num_alloc[class] = st.num_alloc[class].saturating_add(1);
            return Ok(MemBlock {
                buf: Some(vec![0u8; rounded].into_boxed_slice()),
                class,
                len: size,
                pool: Arc::clone(&self.inner),
            });
        }

        let Some(class) = class_for(rounded) else {
            let mut st = self.inner.state.lock();
            st.alloc_errors += 1;
            return Err(Error::Mem);
        };

        let mut st = self.inner.state.lock();

        // 1. Recycle from the exact class.
        if let Some(buf) = st.free_lists[class].pop() {
            st.take_bytes(BLOCK_SIZES[class]);
            st.num_alloc[class] += 1;
            return Ok(self.block(buf, class, size));
        }

        // 2. Carve a fresh block from the uncarved budget.
        let want = BLOCK_SIZES[class];
        if st.unclaimed >= want {
            st.unclaimed -= want;
            st.take_bytes(want);
            st.num_alloc[class] += 1;
            st.carved[class] += 1;
            return Ok(self.block(vec![0u8; want].into_boxed_slice(), class, size));
        }

        // 3. Budget tail exhausted: borrow from a larger class's free list.
        for larger in class + 1..NUM_BLOCK_SIZES {
            if let Some(buf) = st.free_lists[larger].pop() {
                log::warn!(
                    "[VOS] mem waste: {} B request served from {} B class",
                    size,
                    BLOCK_SIZES[larger]
                );
                st.take_bytes(BLOCK_SIZES[larger]);
                st.num_alloc[larger] += 1;
                return Ok(self.block(buf, larger, size));
            }
        }

        st.alloc_errors += 1;
        Err(Error::Mem)
    }

    /// Counter snapshot.
    pub fn statistics(&self) -> MemStatistics {
        let st = self.inner.state.lock();
        MemStatistics {
            total: self.inner.total,
            free: st.free,
            min_free: st.min_free,
            num_alloc: st.num_alloc,
            carved: st.carved,
            alloc_errors: st.alloc_errors,
            free_errors: st.free_errors,
        }
    }

    fn block(&self, buf: Box<[u8]>, class: usize, len: usize) -> MemBlock {
        MemBlock {
            buf: Some(buf),
            class,
            len,
            pool: Arc::clone(&self.inner),
        }
    }
}

impl PoolState {
    fn take_bytes(&mut self, n: usize) {
        self.free -= n;
        if self.free < self.min_free {
            self.min_free = self.free;
        }
    }
}

impl MemBlock {
    /// Requested length (the deref'd view).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-size allocations are rejected at `alloc`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size class the block belongs to.
    pub fn class_size(&self) -> usize {
        BLOCK_SIZES[self.class]
    }
}

impl Deref for MemBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // buf is Some until drop
        match &self.buf {
            Some(b) => &b[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for MemBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.buf {
            Some(b) => &mut b[..len],
            None => &mut [],
        }
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        let mut st = self.pool.state.lock();
        st.num_alloc[self.class] = st.num_alloc[self.class].saturating_sub(1);
        if self.pool.heap_mode {
            return; // plain heap block, nothing to recycle
        }
        buf.fill(0);
        st.free += BLOCK_SIZES[self.class];
        st.free_lists[self.class].push(buf);
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("len", &self.len)
            .field("class_size", &self.class_size())
            .finish()
    }
}
