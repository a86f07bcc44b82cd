//! Runtime composition.
//!
//! One [`Runtime`] per reactor thread: it owns the reactor handle, the byte
//! pool, the request arena, the timer controller, and the host-value
//! registry, and hands clones of itself to every callback so nothing reads
//! process globals. Sockets keep a strong handle to their runtime for the
//! same reason.

use std::rc::Rc;

use crate::arena::RequestArena;
use crate::config::RuntimeOptions;
use crate::host::Scheduler;
use crate::pool::Pool;
use crate::reactor::ReactorRef;
use crate::registry::Registry;
use crate::timer::TimerController;

pub struct Runtime {
    reactor: ReactorRef,
    scheduler: Rc<dyn Scheduler>,
    pool: Rc<Pool>,
    arena: Rc<RequestArena>,
    timers: TimerController,
    registry: Rc<Registry>,
    options: RuntimeOptions,
}

impl Runtime {
    #[must_use]
    pub fn new(
        reactor: ReactorRef,
        scheduler: Rc<dyn Scheduler>,
        options: RuntimeOptions,
    ) -> Rc<Self> {
        let pool = Pool::new();
        pool.set_block_limit(options.pool_block_limit);
        let arena = RequestArena::new(options.request_slots);
        let timers = TimerController::new(Rc::clone(&reactor));
        Rc::new(Self {
            reactor,
            scheduler,
            pool,
            arena,
            timers,
            registry: Registry::new(),
            options,
        })
    }

    #[must_use]
    pub fn reactor(&self) -> &ReactorRef {
        &self.reactor
    }

    #[must_use]
    pub fn scheduler(&self) -> &Rc<dyn Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn pool(&self) -> &Rc<Pool> {
        &self.pool
    }

    #[must_use]
    pub fn arena(&self) -> &Rc<RequestArena> {
        &self.arena
    }

    #[must_use]
    pub fn timers(&self) -> &TimerController {
        &self.timers
    }

    #[must_use]
    pub fn registry(&self) -> &Rc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }
}
