//! Request arena.
//!
//! One [`RequestBlock`] per in-flight connect/write/shutdown: the state a
//! completion needs after the submitting coroutine has suspended. Blocks
//! live in a capacity-bounded slab; ids carry a generation stamp so a late
//! callback holding a stale id (its block already freed by the other side of
//! the completion/timeout race) quietly does nothing instead of touching a
//! recycled slot.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use slab::Slab;

use crate::host::CoroutineRef;
use crate::reactor::TimerId;
use crate::registry::Anchor;
use crate::socket::{OpKind, SocketState};

/// Generation-stamped request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqId {
    index: usize,
    generation: u64,
}

/// Cross-callback state of one in-flight operation.
pub struct RequestBlock {
    pub kind: OpKind,
    /// Waiting coroutine; `None` for fire-and-forget writes.
    pub coroutine: Option<CoroutineRef>,
    /// Deadline timer, while armed. Whichever side of the race runs first
    /// takes it out.
    pub timer: Option<TimerId>,
    /// Set by the timeout path; tells the completion not to resume.
    pub timed_out: bool,
    /// Total payload bytes of a write.
    pub bytes: usize,
    /// Keeps the write payload alive until the block is freed.
    pub payload: Option<Anchor>,
    /// State to roll the socket back to if a connect fails.
    pub restore_state: Option<SocketState>,
}

impl RequestBlock {
    #[must_use]
    pub fn new(kind: OpKind, coroutine: Option<CoroutineRef>) -> Self {
        Self {
            kind,
            coroutine,
            timer: None,
            timed_out: false,
            bytes: 0,
            payload: None,
            restore_state: None,
        }
    }
}

struct Slot {
    generation: u64,
    block: RequestBlock,
}

/// Capacity-bounded allocator for request blocks.
pub struct RequestArena {
    slots: RefCell<Slab<Slot>>,
    capacity: usize,
    next_generation: Cell<u64>,
}

impl RequestArena {
    #[must_use]
    pub fn new(capacity: usize) -> Rc<Self> {
        Rc::new(Self {
            slots: RefCell::new(Slab::new()),
            capacity,
            next_generation: Cell::new(1),
        })
    }

    /// Allocate a block, or `None` on exhaustion. Callers map `None` to
    /// `ENOMEM` and never proceed.
    #[must_use]
    pub fn alloc(&self, block: RequestBlock) -> Option<ReqId> {
        let mut slots = self.slots.borrow_mut();
        if slots.len() >= self.capacity {
            return None;
        }
        let generation = self.next_generation.get();
        self.next_generation.set(generation + 1);
        let index = slots.insert(Slot { generation, block });
        Some(ReqId { index, generation })
    }

    /// Mutate a live block. Returns `None` (doing nothing) when the id is
    /// stale. `f` must not call back into the arena.
    pub fn with<R>(&self, id: ReqId, f: impl FnOnce(&mut RequestBlock) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        Some(f(&mut slot.block))
    }

    /// Free a block, handing it back to the caller so anchors and timers can
    /// be released in the right order. Stale ids return `None`.
    #[must_use]
    pub fn free(&self, id: ReqId) -> Option<RequestBlock> {
        let mut slots = self.slots.borrow_mut();
        match slots.get(id.index) {
            Some(slot) if slot.generation == id.generation => {}
            _ => return None,
        }
        Some(slots.remove(id.index).block)
    }

    /// Number of live blocks; equals the number of in-flight operations at
    /// any quiescent point.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.borrow().len()
    }
}
