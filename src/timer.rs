//! Timer controller.
//!
//! Thin ownership layer over the reactor's one-shot timers, built around the
//! completion/timeout race: for every armed timer exactly one of the two
//! sides returns the slot. The completion side stops a still-armed timer and
//! releases it ([`disarm_and_release`](TimerController::disarm_and_release));
//! the timeout side runs *from* the timer, so it only returns the slot
//! ([`release_fired`](TimerController::release_fired)). Holders keep the id
//! in an `Option` and `take()` it, which makes a double release impossible
//! to write.

use std::cell::Cell;

use crate::reactor::{ReactorRef, TimerCallback, TimerId};

pub struct TimerController {
    reactor: ReactorRef,
    outstanding: Cell<usize>,
}

impl TimerController {
    #[must_use]
    pub fn new(reactor: ReactorRef) -> Self {
        Self {
            reactor,
            outstanding: Cell::new(0),
        }
    }

    /// Obtain a timer slot, or `None` when the reactor declines. Callers
    /// map `None` to `ENOMEM`.
    #[must_use]
    pub fn acquire(&self) -> Option<TimerId> {
        let timer = self.reactor.timer_init().ok()?;
        self.outstanding.set(self.outstanding.get() + 1);
        Some(timer)
    }

    /// Arm as one-shot; no repeat.
    pub fn arm(&self, timer: TimerId, timeout_ms: u64, on_fire: TimerCallback) {
        self.reactor.timer_start(timer, timeout_ms, on_fire);
    }

    /// Completion-first path: stop the timer so its callback never runs,
    /// then return the slot.
    pub fn disarm_and_release(&self, timer: TimerId) {
        self.reactor.timer_stop(timer);
        self.release(timer);
    }

    /// Timeout-first path: the timer has already fired, only the slot
    /// remains to give back.
    pub fn release_fired(&self, timer: TimerId) {
        self.release(timer);
    }

    /// Timer slots currently held by the socket core.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    fn release(&self, timer: TimerId) {
        self.reactor.timer_release(timer);
        self.outstanding.set(self.outstanding.get() - 1);
    }
}
