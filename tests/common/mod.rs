//! Shared harness for the integration tests: scripted coroutines, a test
//! scheduler, and runtime builders over the simulated reactor.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use strandio::config::RuntimeOptions;
use strandio::host::{Coroutine, CoroutineRef, HostValue, Resume, Scheduler};
use strandio::reactor::sim::SimReactor;
use strandio::runtime::Runtime;

/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
pub fn init_tracing() {
    use std::env;

    if env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// A scripted coroutine: records every resume and runs an optional body.
///
/// The body is taken out for the duration of a resume, so a body may replace
/// itself; when it does not, it stays installed for the next resume.
pub struct Fiber {
    name: String,
    resumes: RefCell<Vec<Resume>>,
    body: RefCell<Option<Box<dyn FnMut(Resume)>>>,
}

impl Fiber {
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            resumes: RefCell::new(Vec::new()),
            body: RefCell::new(None),
        })
    }

    pub fn set_body(&self, body: impl FnMut(Resume) + 'static) {
        *self.body.borrow_mut() = Some(Box::new(body));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resumes(&self) -> Vec<Resume> {
        self.resumes.borrow().clone()
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.borrow().len()
    }

    pub fn last_resume(&self) -> Option<Resume> {
        self.resumes.borrow().last().cloned()
    }
}

impl Coroutine for Fiber {
    fn resume(&self, value: Resume) {
        self.resumes.borrow_mut().push(value.clone());
        let taken = self.body.borrow_mut().take();
        if let Some(mut body) = taken {
            body(value);
            let mut slot = self.body.borrow_mut();
            if slot.is_none() {
                *slot = Some(body);
            }
        }
    }
}

/// Scheduler that spawns a [`Fiber`] per accepted connection and wires the
/// anchored on-connect callable in as its body.
pub struct TestScheduler {
    pub spawned: RefCell<Vec<Rc<Fiber>>>,
}

impl TestScheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            spawned: RefCell::new(Vec::new()),
        })
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.borrow().len()
    }
}

impl Scheduler for TestScheduler {
    fn spawn(&self, _parent: &CoroutineRef, entry: &HostValue) -> CoroutineRef {
        let fiber = Fiber::new("accepted");
        if let HostValue::Callable(body) = entry {
            let body = Rc::clone(body);
            let co: CoroutineRef = fiber.clone();
            fiber.set_body(move |resume| (body.as_ref())(&co, resume));
        }
        self.spawned.borrow_mut().push(fiber.clone());
        fiber
    }
}

/// A runtime wired to the simulated reactor.
pub struct SimRig {
    pub sim: Rc<SimReactor>,
    pub rt: Rc<Runtime>,
    pub sched: Rc<TestScheduler>,
}

impl SimRig {
    /// No requests in flight, no timer slots held.
    pub fn assert_quiescent(&self) {
        assert_eq!(self.rt.arena().in_use(), 0, "request blocks still live");
        assert_eq!(self.rt.timers().outstanding(), 0, "timer slots still held");
        assert_eq!(self.sim.armed_timer_count(), 0, "timers still armed");
    }

    pub fn registry_live(&self) -> usize {
        self.rt.registry().live()
    }
}

pub fn sim_rig() -> SimRig {
    sim_rig_with(RuntimeOptions::default())
}

/// A connected client/server pair on the sim, with the listener kept alive.
pub struct Pair {
    pub client: strandio::socket::SocketRef,
    pub client_fiber: Rc<Fiber>,
    pub client_co: CoroutineRef,
    pub server_sock: Rc<RefCell<Option<strandio::socket::SocketRef>>>,
    pub listener: strandio::socket::SocketRef,
    pub owner: Rc<Fiber>,
}

/// Bind a listener on an ephemeral port, connect a client to it, and run
/// the reactor until both sides are established. The accepted socket is
/// parked in `server_sock`; the client fiber has no body installed, so
/// resumes are recorded and tests may attach behavior afterwards.
pub fn establish_pair(rig: &SimRig) -> Pair {
    use strandio::ops::{self, Op};

    let owner = Fiber::new("listener-owner");
    let owner_co: CoroutineRef = owner.clone();
    let listener = ops::new_socket(&rig.rt, &owner_co, true).expect("listener socket");
    assert_eq!(ops::bind(&listener, 0, "127.0.0.1", false).unwrap(), 0);

    let server_sock: Rc<RefCell<Option<strandio::socket::SocketRef>>> =
        Rc::new(RefCell::new(None));
    let on_connect: strandio::host::HostFn = {
        let server_sock = Rc::clone(&server_sock);
        Rc::new(move |_co, resume| {
            if let Resume::Socket(sock) = resume {
                *server_sock.borrow_mut() = Some(sock);
            }
        })
    };
    assert_eq!(
        ops::listen(&listener, HostValue::Callable(on_connect), 16).unwrap(),
        0
    );
    let (addr, code) = ops::local_address(&listener).unwrap();
    assert_eq!(code, 0);
    let port = i64::from(addr.expect("listener address").port);

    let client_fiber = Fiber::new("client");
    let client_co: CoroutineRef = client_fiber.clone();
    let client = ops::new_socket(&rig.rt, &client_co, false).expect("client socket");
    assert!(matches!(
        ops::connect(&client, &client_co, port, "127.0.0.1").unwrap(),
        Op::Yield
    ));
    rig.sim.run();
    assert_eq!(client_fiber.last_resume(), Some(Resume::Int(0)));
    assert!(server_sock.borrow().is_some(), "no connection accepted");

    Pair {
        client,
        client_fiber,
        client_co,
        server_sock,
        listener,
        owner,
    }
}

pub fn sim_rig_with(options: RuntimeOptions) -> SimRig {
    init_tracing();
    let sim = SimReactor::new();
    let sched = TestScheduler::new();
    let rt = Runtime::new(sim.clone(), sched.clone(), options);
    SimRig { sim, rt, sched }
}
