//! Host-value registry.
//!
//! Keeps host values reachable across an asynchronous boundary: payloads of
//! in-flight writes, accept callbacks, and coroutines that must outlive the
//! script frame that created them. An [`Anchor`] is the owning handle; its
//! drop is the release, so every anchor is released exactly once on every
//! completion path.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use slab::Slab;

use crate::host::HostValue;

/// Process-wide table of anchored host values.
///
/// Reactor-thread only; no internal synchronization.
pub struct Registry {
    slots: RefCell<Slab<HostValue>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            slots: RefCell::new(Slab::new()),
        })
    }

    /// Anchor `value`, keeping it alive until the returned [`Anchor`] drops.
    #[must_use]
    pub fn anchor(self: &Rc<Self>, value: HostValue) -> Anchor {
        let key = self.slots.borrow_mut().insert(value);
        Anchor {
            registry: Rc::clone(self),
            key,
        }
    }

    /// Look up an anchored value by its slot key.
    #[must_use]
    pub fn get(&self, key: usize) -> Option<HostValue> {
        self.slots.borrow().get(key).cloned()
    }

    /// Number of currently anchored values.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.borrow().len()
    }
}

/// Owning reference to a registry slot; dropping it unanchors the value.
pub struct Anchor {
    registry: Rc<Registry>,
    key: usize,
}

impl Anchor {
    #[must_use]
    pub fn key(&self) -> usize {
        self.key
    }

    /// The anchored value.
    #[must_use]
    pub fn value(&self) -> Option<HostValue> {
        self.registry.get(self.key)
    }
}

impl Drop for Anchor {
    fn drop(&mut self) {
        let mut slots = self.registry.slots.borrow_mut();
        if slots.contains(self.key) {
            slots.remove(self.key);
        }
    }
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anchor").field("key", &self.key).finish()
    }
}
