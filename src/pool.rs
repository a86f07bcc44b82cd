//! Byte-block memory pool.
//!
//! Backs read buffers. Blocks are rounded up to power-of-two size classes
//! and recycled through per-class free lists; callers must use
//! [`PoolBlock::capacity`] (the real, rounded size) rather than the size
//! they asked for. A block returns to its class's free list on drop.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use hashbrown::HashMap;

/// Smallest size class handed out.
pub const MIN_BLOCK: usize = 64;

struct PoolState {
    free: HashMap<usize, Vec<Box<[u8]>>>,
    live: usize,
    limit: Option<usize>,
}

/// Reactor-thread byte pool. Not thread-safe by design.
pub struct Pool {
    state: RefCell<PoolState>,
}

impl Pool {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PoolState {
                free: HashMap::new(),
                live: 0,
                limit: None,
            }),
        })
    }

    /// Allocate a block of at least `size` bytes, or `None` when the pool is
    /// at its configured limit. Callers map `None` to `ENOMEM`.
    #[must_use]
    pub fn alloc(self: &Rc<Self>, size: usize) -> Option<PoolBlock> {
        let class = size.max(MIN_BLOCK).next_power_of_two();
        let mut state = self.state.borrow_mut();
        if let Some(limit) = state.limit {
            if state.live >= limit {
                return None;
            }
        }
        let data = state
            .free
            .get_mut(&class)
            .and_then(Vec::pop)
            .unwrap_or_else(|| vec![0u8; class].into_boxed_slice());
        state.live += 1;
        Some(PoolBlock {
            data: Some(data),
            pool: Rc::clone(self),
        })
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.state.borrow().live
    }

    /// Cap the number of live blocks; `None` removes the cap. Used by tests
    /// to exercise the out-of-memory paths.
    pub fn set_block_limit(&self, limit: Option<usize>) {
        self.state.borrow_mut().limit = limit;
    }

    fn reclaim(&self, data: Box<[u8]>) {
        let mut state = self.state.borrow_mut();
        state.live -= 1;
        state.free.entry(data.len()).or_default().push(data);
    }
}

/// One pool allocation. Dereferences to its byte storage; the length is the
/// block's true capacity.
pub struct PoolBlock {
    data: Option<Box<[u8]>>,
    pool: Rc<Pool>,
}

impl PoolBlock {
    /// Real capacity of the block (the rounded class size).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }
}

impl Deref for PoolBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PoolBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.reclaim(data);
        }
    }
}

impl fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBlock")
            .field("capacity", &self.capacity())
            .finish()
    }
}
