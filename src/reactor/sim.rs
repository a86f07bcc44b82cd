//! Deterministic in-memory reactor.
//!
//! Streams are loopback pairs inside one process: `connect` routes to a
//! listening stream by port, writes land in the peer's incoming queue, and a
//! manual clock drives the timers. Everything the kernel would decide is
//! scriptable per stream — how many bytes `try_write` accepts, whether
//! queued writes complete on their own, what a connect attempt does — which
//! is what the timeout-race and partial-write tests need.
//!
//! Callback discipline: trait methods and control methods only enqueue
//! work; callbacks run inside [`run`](SimReactor::run) (and from
//! [`advance`](SimReactor::advance)), after every internal borrow has been
//! dropped. Host code called back may therefore re-enter the reactor
//! freely.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use bytes::Bytes;
use hashbrown::HashMap;
use slab::Slab;

use crate::errno;
use crate::reactor::{
    AllocCallback, CloseCallback, ConnectionCallback, ReadCallback, Reactor, StatusCallback,
    StreamId, TimerCallback, TimerId,
};

const SUGGESTED_READ: usize = 64 * 1024;
const EPHEMERAL_BASE: u16 = 40000;

/// What a connect attempt against an address does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// Route to a listening stream on the target port; refuse when there is
    /// none. The default.
    Route,
    /// Complete with `ECONNREFUSED`.
    Refuse,
    /// Never complete on its own (a silently dropping network). The test
    /// may finish it later with [`SimReactor::complete_connect`].
    Blackhole,
}

/// How `try_write` behaves on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryWriteMode {
    /// Accept bytes up to the configured cap.
    Accept,
    /// Report `EAGAIN` without taking anything.
    WouldBlock,
    /// Report `ENOSYS` (platform without the fast path).
    Unsupported,
    /// Report a hard failure.
    Fail(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Listening,
}

#[derive(Clone)]
struct ReadHooks {
    on_alloc: Rc<RefCell<AllocCallback>>,
    on_read: Rc<RefCell<ReadCallback>>,
}

struct ListenerState {
    on_connection: Rc<RefCell<ConnectionCallback>>,
    pending: VecDeque<usize>,
}

struct PendingWrite {
    data: Vec<Bytes>,
    on_complete: StatusCallback,
}

struct SimStream {
    phase: Phase,
    bound: Option<SocketAddr>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    peer: Option<usize>,
    incoming: VecDeque<u8>,
    eof_pending: bool,
    /// Bytes written before the server side was accepted.
    parked: Vec<u8>,
    reading: Option<ReadHooks>,
    listener: Option<ListenerState>,
    connect_cb: Option<StatusCallback>,
    writes: VecDeque<PendingWrite>,
    manual_writes: bool,
    try_write_cap: Option<usize>,
    try_write_mode: TryWriteMode,
    nodelay: bool,
    keepalive: Option<(bool, u32)>,
    close_cb: Option<CloseCallback>,
    closing: bool,
    closed: bool,
}

impl SimStream {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            bound: None,
            local: None,
            remote: None,
            peer: None,
            incoming: VecDeque::new(),
            eof_pending: false,
            parked: Vec::new(),
            reading: None,
            listener: None,
            connect_cb: None,
            writes: VecDeque::new(),
            manual_writes: false,
            try_write_cap: None,
            try_write_mode: TryWriteMode::Accept,
            nodelay: false,
            keepalive: None,
            close_cb: None,
            closing: false,
            closed: false,
        }
    }
}

struct SimTimer {
    armed: Option<(u64, TimerCallback)>,
}

enum SimEvent {
    Readable(usize),
    ReadZero(usize),
    ConnectResult { stream: usize, status: i32 },
    Incoming { listener: usize },
    FlushWrites(usize),
    ShutdownDone { stream: usize, on_complete: StatusCallback },
    CloseStream(usize),
}

struct SimState {
    streams: Slab<SimStream>,
    timers: Slab<SimTimer>,
    /// port -> (stream, reuse_port) bindings
    port_bindings: HashMap<u16, Vec<(usize, bool)>>,
    /// port -> listening streams
    listeners: HashMap<u16, Vec<usize>>,
    policies: HashMap<IpAddr, ConnectPolicy>,
    next_port: u16,
}

pub struct SimReactor {
    state: RefCell<SimState>,
    events: RefCell<VecDeque<SimEvent>>,
    now_ms: Cell<u64>,
    dispatching: Cell<bool>,
    fail_next_accept: Cell<Option<i32>>,
}

impl SimReactor {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(SimState {
                streams: Slab::new(),
                timers: Slab::new(),
                port_bindings: HashMap::new(),
                listeners: HashMap::new(),
                policies: HashMap::new(),
                next_port: EPHEMERAL_BASE,
            }),
            events: RefCell::new(VecDeque::new()),
            now_ms: Cell::new(0),
            dispatching: Cell::new(false),
            fail_next_accept: Cell::new(None),
        })
    }

    /// Drain the event queue, delivering callbacks. Re-entrant calls are
    /// no-ops; the outermost run finishes the drain.
    pub fn run(&self) {
        if self.dispatching.get() {
            return;
        }
        self.dispatching.set(true);
        loop {
            let event = self.events.borrow_mut().pop_front();
            let Some(event) = event else {
                break;
            };
            self.dispatch(event);
        }
        self.dispatching.set(false);
    }

    /// Move the clock forward, firing due timers in deadline order and
    /// draining events after each.
    pub fn advance(&self, ms: u64) {
        let target = self.now_ms.get() + ms;
        loop {
            let due = {
                let state = self.state.borrow();
                state
                    .timers
                    .iter()
                    .filter_map(|(id, t)| t.armed.as_ref().map(|(deadline, _)| (*deadline, id)))
                    .min()
            };
            match due {
                Some((deadline, id)) if deadline <= target => {
                    if deadline > self.now_ms.get() {
                        self.now_ms.set(deadline);
                    }
                    let fired = {
                        let mut state = self.state.borrow_mut();
                        state.timers.get_mut(id).and_then(|t| t.armed.take())
                    };
                    if let Some((_, on_fire)) = fired {
                        on_fire();
                    }
                    self.run();
                }
                _ => break,
            }
        }
        self.now_ms.set(target);
        self.run();
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    // --- test controls -----------------------------------------------------

    pub fn set_connect_policy(&self, ip: IpAddr, policy: ConnectPolicy) {
        self.state.borrow_mut().policies.insert(ip, policy);
    }

    /// Synthesize a (possibly late) connect completion.
    pub fn complete_connect(&self, s: StreamId, status: i32) {
        self.events
            .borrow_mut()
            .push_back(SimEvent::ConnectResult {
                stream: s.0,
                status,
            });
        self.run();
    }

    /// Cap how many bytes a single `try_write` accepts.
    pub fn set_try_write_cap(&self, s: StreamId, cap: Option<usize>) {
        if let Some(stream) = self.state.borrow_mut().streams.get_mut(s.0) {
            stream.try_write_cap = cap;
        }
    }

    pub fn set_try_write_mode(&self, s: StreamId, mode: TryWriteMode) {
        if let Some(stream) = self.state.borrow_mut().streams.get_mut(s.0) {
            stream.try_write_mode = mode;
        }
    }

    /// Queued writes stop completing on their own; the test finishes them
    /// with [`complete_next_write`](Self::complete_next_write).
    pub fn set_manual_writes(&self, s: StreamId, manual: bool) {
        if let Some(stream) = self.state.borrow_mut().streams.get_mut(s.0) {
            stream.manual_writes = manual;
        }
    }

    /// Conclude the oldest queued write with `status`, delivering its bytes
    /// on success.
    pub fn complete_next_write(&self, s: StreamId, status: i32) {
        let taken = {
            let mut state = self.state.borrow_mut();
            state
                .streams
                .get_mut(s.0)
                .and_then(|stream| stream.writes.pop_front())
        };
        let Some(write) = taken else {
            return;
        };
        if status == 0 {
            let flat: Vec<u8> = write.data.iter().flat_map(|b| b.iter().copied()).collect();
            self.deliver(s.0, &flat);
        }
        (write.on_complete)(status);
        self.run();
    }

    #[must_use]
    pub fn pending_write_count(&self, s: StreamId) -> usize {
        self.state
            .borrow()
            .streams
            .get(s.0)
            .map_or(0, |stream| stream.writes.len())
    }

    /// Segments of the oldest queued write, for iovec inspection.
    #[must_use]
    pub fn queued_write_segments(&self, s: StreamId) -> Option<Vec<Vec<u8>>> {
        self.state.borrow().streams.get(s.0).and_then(|stream| {
            stream
                .writes
                .front()
                .map(|w| w.data.iter().map(|b| b.to_vec()).collect())
        })
    }

    /// Inject bytes as if the peer had sent them.
    pub fn push_incoming(&self, s: StreamId, data: &[u8]) {
        self.deliver(s.0, data);
        self.run();
    }

    /// Inject a half-close from the peer.
    pub fn deliver_eof(&self, s: StreamId) {
        if let Some(stream) = self.state.borrow_mut().streams.get_mut(s.0) {
            stream.eof_pending = true;
        }
        self.events.borrow_mut().push_back(SimEvent::Readable(s.0));
        self.run();
    }

    /// Deliver one "nothing read this round" callback.
    pub fn poke_read_zero(&self, s: StreamId) {
        self.events.borrow_mut().push_back(SimEvent::ReadZero(s.0));
        self.run();
    }

    /// Make the next `accept` fail with `code`.
    pub fn fail_next_accept(&self, code: i32) {
        self.fail_next_accept.set(Some(code));
    }

    #[must_use]
    pub fn timer_slot_count(&self) -> usize {
        self.state.borrow().timers.len()
    }

    #[must_use]
    pub fn armed_timer_count(&self) -> usize {
        self.state
            .borrow()
            .timers
            .iter()
            .filter(|(_, t)| t.armed.is_some())
            .count()
    }

    #[must_use]
    pub fn nodelay_flag(&self, s: StreamId) -> Option<bool> {
        self.state.borrow().streams.get(s.0).map(|st| st.nodelay)
    }

    #[must_use]
    pub fn keepalive_setting(&self, s: StreamId) -> Option<(bool, u32)> {
        self.state.borrow().streams.get(s.0).and_then(|st| st.keepalive)
    }

    // --- internals ---------------------------------------------------------

    /// Append bytes to a stream's incoming queue (or to the write side's
    /// parked bytes while the peer does not exist yet) and schedule a read.
    fn deliver(&self, target: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let mut state = self.state.borrow_mut();
            match state.streams.get_mut(target) {
                Some(stream) if !stream.closed => stream.incoming.extend(data.iter().copied()),
                _ => return,
            }
        }
        self.events
            .borrow_mut()
            .push_back(SimEvent::Readable(target));
    }

    fn deliver_to_peer(&self, source: usize, data: &[u8]) {
        let peer = {
            let mut state = self.state.borrow_mut();
            match state.streams.get_mut(source) {
                Some(stream) => match stream.peer {
                    Some(peer) => Some(peer),
                    None => {
                        stream.parked.extend_from_slice(data);
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(peer) = peer {
            self.deliver(peer, data);
        }
    }

    fn dispatch(&self, event: SimEvent) {
        match event {
            SimEvent::Readable(s) => self.dispatch_readable(s),
            SimEvent::ReadZero(s) => {
                let hooks = {
                    let state = self.state.borrow();
                    state.streams.get(s).and_then(|st| st.reading.clone())
                };
                if let Some(hooks) = hooks {
                    (&mut *hooks.on_read.borrow_mut())(0);
                }
            }
            SimEvent::ConnectResult { stream, status } => {
                let cb = {
                    let mut state = self.state.borrow_mut();
                    match state.streams.get_mut(stream) {
                        Some(st) if !st.closed => {
                            if status == 0 {
                                st.phase = Phase::Connected;
                            } else {
                                st.phase = Phase::Idle;
                            }
                            st.connect_cb.take()
                        }
                        _ => None,
                    }
                };
                if let Some(cb) = cb {
                    cb(status);
                }
            }
            SimEvent::Incoming { listener } => {
                let cb = {
                    let state = self.state.borrow();
                    state
                        .streams
                        .get(listener)
                        .filter(|st| !st.closed)
                        .and_then(|st| st.listener.as_ref())
                        .map(|ls| Rc::clone(&ls.on_connection))
                };
                if let Some(cb) = cb {
                    (&mut *cb.borrow_mut())(0);
                }
            }
            SimEvent::FlushWrites(s) => self.dispatch_flush(s),
            SimEvent::ShutdownDone { stream, on_complete } => {
                self.dispatch_flush(stream);
                let peer = {
                    let state = self.state.borrow();
                    state.streams.get(stream).and_then(|st| st.peer)
                };
                if let Some(peer) = peer {
                    if let Some(st) = self.state.borrow_mut().streams.get_mut(peer) {
                        st.eof_pending = true;
                    }
                    self.events.borrow_mut().push_back(SimEvent::Readable(peer));
                }
                on_complete(0);
            }
            SimEvent::CloseStream(s) => self.dispatch_close(s),
        }
    }

    fn dispatch_readable(&self, s: usize) {
        let (hooks, has_data, eof) = {
            let state = self.state.borrow();
            let Some(stream) = state.streams.get(s) else {
                return;
            };
            if stream.closed {
                return;
            }
            let Some(hooks) = stream.reading.clone() else {
                return;
            };
            (hooks, !stream.incoming.is_empty(), stream.eof_pending)
        };
        if !has_data && !eof {
            return;
        }

        let slot = (&mut *hooks.on_alloc.borrow_mut())(SUGGESTED_READ);
        let Some(slot) = slot else {
            // Declined: the host tore the read down inside the callback.
            return;
        };

        let filled = {
            let mut buffer = slot.borrow_mut();
            let writable = buffer.writable();
            if writable.is_empty() {
                None
            } else {
                let mut state = self.state.borrow_mut();
                let Some(stream) = state.streams.get_mut(s) else {
                    return;
                };
                let n = writable.len().min(stream.incoming.len());
                for dst in writable.iter_mut().take(n) {
                    if let Some(byte) = stream.incoming.pop_front() {
                        *dst = byte;
                    }
                }
                Some(n)
            }
        };

        match filled {
            None => (&mut *hooks.on_read.borrow_mut())(errno::ENOBUFS as isize),
            Some(0) => {
                let at_eof = {
                    let state = self.state.borrow();
                    state
                        .streams
                        .get(s)
                        .is_some_and(|st| st.incoming.is_empty() && st.eof_pending)
                };
                if at_eof {
                    (&mut *hooks.on_read.borrow_mut())(errno::EOF as isize);
                }
            }
            Some(n) => (&mut *hooks.on_read.borrow_mut())(n as isize),
        }

        // More buffered data (or a pending EOF) while the read is still
        // active: go around again on a fresh event.
        let again = {
            let state = self.state.borrow();
            state.streams.get(s).is_some_and(|st| {
                !st.closed
                    && st.reading.is_some()
                    && (!st.incoming.is_empty() || st.eof_pending)
            })
        };
        if again {
            self.events.borrow_mut().push_back(SimEvent::Readable(s));
        }
    }

    fn dispatch_flush(&self, s: usize) {
        loop {
            let taken = {
                let mut state = self.state.borrow_mut();
                match state.streams.get_mut(s) {
                    Some(stream) if !stream.closed && !stream.manual_writes => {
                        stream.writes.pop_front()
                    }
                    _ => None,
                }
            };
            let Some(write) = taken else {
                break;
            };
            let flat: Vec<u8> = write.data.iter().flat_map(|b| b.iter().copied()).collect();
            self.deliver_to_peer(s, &flat);
            (write.on_complete)(0);
        }
    }

    fn dispatch_close(&self, s: usize) {
        let (connect_cb, writes, peer, close_cb) = {
            let mut state = self.state.borrow_mut();
            let Some(stream) = state.streams.get_mut(s) else {
                return;
            };
            let connect_cb = stream.connect_cb.take();
            let writes: Vec<PendingWrite> = stream.writes.drain(..).collect();
            let peer = stream.peer.take();
            let close_cb = stream.close_cb.take();
            let port = stream.bound.map(|a| a.port());
            stream.reading = None;
            stream.listener = None;
            stream.closed = true;
            stream.phase = Phase::Idle;
            if let Some(port) = port {
                if let Some(entries) = state.port_bindings.get_mut(&port) {
                    entries.retain(|(idx, _)| *idx != s);
                }
                if let Some(entries) = state.listeners.get_mut(&port) {
                    entries.retain(|idx| *idx != s);
                }
            }
            (connect_cb, writes, peer, close_cb)
        };
        if let Some(cb) = connect_cb {
            cb(errno::ECANCELED);
        }
        for write in writes {
            (write.on_complete)(errno::ECANCELED);
        }
        if let Some(peer) = peer {
            {
                let mut state = self.state.borrow_mut();
                if let Some(st) = state.streams.get_mut(peer) {
                    st.eof_pending = true;
                    st.peer = None;
                }
            }
            self.events.borrow_mut().push_back(SimEvent::Readable(peer));
        }
        if let Some(cb) = close_cb {
            cb();
        }
    }
}

impl Reactor for SimReactor {
    fn stream_init(&self) -> Result<StreamId, i32> {
        let idx = self.state.borrow_mut().streams.insert(SimStream::new());
        Ok(StreamId(idx))
    }

    fn tcp_bind(&self, s: StreamId, addr: SocketAddr, reuse_port: bool) -> i32 {
        let mut state = self.state.borrow_mut();
        match state.streams.get(s.0) {
            Some(stream) if !stream.closed => {
                if stream.bound.is_some() {
                    return errno::EINVAL;
                }
            }
            _ => return errno::EINVAL,
        }
        let port = if addr.port() == 0 {
            let p = state.next_port;
            state.next_port += 1;
            p
        } else {
            addr.port()
        };
        if let Some(entries) = state.port_bindings.get(&port) {
            let compatible = reuse_port && entries.iter().all(|(_, reuse)| *reuse);
            if !entries.is_empty() && !compatible {
                return errno::EADDRINUSE;
            }
        }
        state.port_bindings.entry(port).or_default().push((s.0, reuse_port));
        let full = SocketAddr::new(addr.ip(), port);
        if let Some(stream) = state.streams.get_mut(s.0) {
            stream.bound = Some(full);
            stream.local = Some(full);
        }
        0
    }

    fn listen(&self, s: StreamId, _backlog: i32, on_connection: ConnectionCallback) -> i32 {
        let mut state = self.state.borrow_mut();
        match state.streams.get(s.0) {
            Some(stream) if !stream.closed && stream.listener.is_none() => {}
            _ => return errno::EINVAL,
        }
        let port = match state.streams.get(s.0).and_then(|st| st.bound) {
            Some(addr) => addr.port(),
            None => {
                let p = state.next_port;
                state.next_port += 1;
                let full = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), p);
                state.port_bindings.entry(p).or_default().push((s.0, false));
                if let Some(stream) = state.streams.get_mut(s.0) {
                    stream.bound = Some(full);
                    stream.local = Some(full);
                }
                p
            }
        };
        if let Some(stream) = state.streams.get_mut(s.0) {
            stream.phase = Phase::Listening;
            stream.listener = Some(ListenerState {
                on_connection: Rc::new(RefCell::new(on_connection)),
                pending: VecDeque::new(),
            });
        }
        state.listeners.entry(port).or_default().push(s.0);
        0
    }

    fn accept(&self, server: StreamId, child: StreamId) -> i32 {
        if let Some(code) = self.fail_next_accept.take() {
            return code;
        }
        let mut state = self.state.borrow_mut();
        let client = match state
            .streams
            .get_mut(server.0)
            .and_then(|st| st.listener.as_mut())
            .and_then(|ls| ls.pending.pop_front())
        {
            Some(client) => client,
            None => return errno::EAGAIN,
        };
        let server_local = state.streams.get(server.0).and_then(|st| st.local);
        let (client_local, parked, client_closed) = match state.streams.get_mut(client) {
            Some(st) => {
                st.peer = Some(child.0);
                (st.local, std::mem::take(&mut st.parked), st.closed)
            }
            None => (None, Vec::new(), true),
        };
        let has_incoming = !parked.is_empty();
        match state.streams.get_mut(child.0) {
            Some(st) => {
                st.phase = Phase::Connected;
                st.peer = Some(client);
                st.local = server_local;
                st.remote = client_local;
                st.incoming.extend(parked);
                if client_closed {
                    st.eof_pending = true;
                }
            }
            None => return errno::EINVAL,
        }
        drop(state);
        if has_incoming || client_closed {
            self.events
                .borrow_mut()
                .push_back(SimEvent::Readable(child.0));
        }
        0
    }

    fn connect(&self, s: StreamId, addr: SocketAddr, on_complete: StatusCallback) -> i32 {
        let mut state = self.state.borrow_mut();
        match state.streams.get(s.0) {
            Some(stream) if !stream.closed && stream.phase == Phase::Idle => {}
            _ => return errno::EINVAL,
        }
        let policy = state
            .policies
            .get(&addr.ip())
            .copied()
            .unwrap_or(ConnectPolicy::Route);
        let ephemeral = {
            let p = state.next_port;
            state.next_port += 1;
            p
        };
        if let Some(stream) = state.streams.get_mut(s.0) {
            stream.phase = Phase::Connecting;
            stream.connect_cb = Some(on_complete);
            stream.remote = Some(addr);
            if stream.local.is_none() {
                stream.local = Some(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    ephemeral,
                ));
            }
        }
        let mut events = Vec::new();
        match policy {
            ConnectPolicy::Blackhole => {}
            ConnectPolicy::Refuse => events.push(SimEvent::ConnectResult {
                stream: s.0,
                status: errno::ECONNREFUSED,
            }),
            ConnectPolicy::Route => {
                let listener = state
                    .listeners
                    .get(&addr.port())
                    .and_then(|candidates| {
                        candidates
                            .iter()
                            .copied()
                            .find(|idx| state.streams.get(*idx).is_some_and(|st| !st.closed))
                    });
                match listener {
                    Some(listener) => {
                        if let Some(ls) = state
                            .streams
                            .get_mut(listener)
                            .and_then(|st| st.listener.as_mut())
                        {
                            ls.pending.push_back(s.0);
                        }
                        events.push(SimEvent::Incoming { listener });
                        events.push(SimEvent::ConnectResult {
                            stream: s.0,
                            status: 0,
                        });
                    }
                    None => events.push(SimEvent::ConnectResult {
                        stream: s.0,
                        status: errno::ECONNREFUSED,
                    }),
                }
            }
        }
        drop(state);
        self.events.borrow_mut().extend(events);
        0
    }

    fn read_start(&self, s: StreamId, on_alloc: AllocCallback, on_read: ReadCallback) -> i32 {
        {
            let mut state = self.state.borrow_mut();
            match state.streams.get_mut(s.0) {
                Some(stream) if !stream.closed => {
                    if stream.phase != Phase::Connected {
                        return errno::ENOTCONN;
                    }
                    stream.reading = Some(ReadHooks {
                        on_alloc: Rc::new(RefCell::new(on_alloc)),
                        on_read: Rc::new(RefCell::new(on_read)),
                    });
                }
                _ => return errno::EINVAL,
            }
        }
        self.events.borrow_mut().push_back(SimEvent::Readable(s.0));
        0
    }

    fn read_stop(&self, s: StreamId) -> i32 {
        if let Some(stream) = self.state.borrow_mut().streams.get_mut(s.0) {
            stream.reading = None;
        }
        0
    }

    fn try_write(&self, s: StreamId, bufs: &[IoSlice<'_>]) -> isize {
        let accepted: Vec<u8> = {
            let state = self.state.borrow();
            let Some(stream) = state.streams.get(s.0) else {
                return errno::EINVAL as isize;
            };
            if stream.closed || stream.closing {
                return errno::EPIPE as isize;
            }
            if stream.phase != Phase::Connected {
                return errno::ENOTCONN as isize;
            }
            match stream.try_write_mode {
                TryWriteMode::WouldBlock => return errno::EAGAIN as isize,
                TryWriteMode::Unsupported => return errno::ENOSYS as isize,
                TryWriteMode::Fail(code) => return code as isize,
                TryWriteMode::Accept => {}
            }
            let total: usize = bufs.iter().map(|b| b.len()).sum();
            let cap = stream.try_write_cap.unwrap_or(usize::MAX);
            let take = total.min(cap);
            if take == 0 && total > 0 {
                return errno::EAGAIN as isize;
            }
            bufs.iter()
                .flat_map(|b| b.iter().copied())
                .take(take)
                .collect()
        };
        let n = accepted.len();
        self.deliver_to_peer(s.0, &accepted);
        n as isize
    }

    fn write2(&self, s: StreamId, bufs: Vec<Bytes>, on_complete: StatusCallback) -> i32 {
        let manual = {
            let mut state = self.state.borrow_mut();
            let Some(stream) = state.streams.get_mut(s.0) else {
                return errno::EINVAL;
            };
            if stream.closed || stream.closing {
                return errno::EPIPE;
            }
            if stream.phase != Phase::Connected {
                return errno::ENOTCONN;
            }
            stream.writes.push_back(PendingWrite {
                data: bufs,
                on_complete,
            });
            stream.manual_writes
        };
        if !manual {
            self.events
                .borrow_mut()
                .push_back(SimEvent::FlushWrites(s.0));
        }
        0
    }

    fn shutdown(&self, s: StreamId, on_complete: StatusCallback) -> i32 {
        {
            let state = self.state.borrow();
            match state.streams.get(s.0) {
                Some(stream) if !stream.closed && stream.phase == Phase::Connected => {}
                _ => return errno::ENOTCONN,
            }
        }
        self.events.borrow_mut().push_back(SimEvent::ShutdownDone {
            stream: s.0,
            on_complete,
        });
        0
    }

    fn close(&self, s: StreamId, on_close: Option<CloseCallback>) {
        {
            let mut state = self.state.borrow_mut();
            let Some(stream) = state.streams.get_mut(s.0) else {
                return;
            };
            stream.closing = true;
            stream.close_cb = on_close;
        }
        self.events
            .borrow_mut()
            .push_back(SimEvent::CloseStream(s.0));
    }

    fn is_closing(&self, s: StreamId) -> bool {
        self.state
            .borrow()
            .streams
            .get(s.0)
            .is_some_and(|st| st.closing || st.closed)
    }

    fn tcp_nodelay(&self, s: StreamId, enable: bool) -> i32 {
        match self.state.borrow_mut().streams.get_mut(s.0) {
            Some(stream) if !stream.closed => {
                stream.nodelay = enable;
                0
            }
            _ => errno::EINVAL,
        }
    }

    fn tcp_keepalive(&self, s: StreamId, enable: bool, delay_secs: u32) -> i32 {
        match self.state.borrow_mut().streams.get_mut(s.0) {
            Some(stream) if !stream.closed => {
                stream.keepalive = Some((enable, delay_secs));
                0
            }
            _ => errno::EINVAL,
        }
    }

    fn getsockname(&self, s: StreamId) -> Result<SocketAddr, i32> {
        self.state
            .borrow()
            .streams
            .get(s.0)
            .and_then(|st| st.local)
            .ok_or(errno::EINVAL)
    }

    fn getpeername(&self, s: StreamId) -> Result<SocketAddr, i32> {
        self.state
            .borrow()
            .streams
            .get(s.0)
            .filter(|st| st.phase == Phase::Connected)
            .and_then(|st| st.remote)
            .ok_or(errno::ENOTCONN)
    }

    fn fd(&self, s: StreamId) -> i32 {
        match self.state.borrow().streams.get(s.0) {
            Some(stream) if !stream.closed => 1000 + s.0 as i32,
            _ => errno::EINVAL,
        }
    }

    fn timer_init(&self) -> Result<TimerId, i32> {
        let idx = self
            .state
            .borrow_mut()
            .timers
            .insert(SimTimer { armed: None });
        Ok(TimerId(idx))
    }

    fn timer_start(&self, t: TimerId, timeout_ms: u64, on_fire: TimerCallback) -> i32 {
        let deadline = self.now_ms.get() + timeout_ms;
        match self.state.borrow_mut().timers.get_mut(t.0) {
            Some(timer) => {
                timer.armed = Some((deadline, on_fire));
                0
            }
            None => errno::EINVAL,
        }
    }

    fn timer_stop(&self, t: TimerId) -> i32 {
        if let Some(timer) = self.state.borrow_mut().timers.get_mut(t.0) {
            timer.armed = None;
        }
        0
    }

    fn timer_release(&self, t: TimerId) {
        let mut state = self.state.borrow_mut();
        if state.timers.contains(t.0) {
            state.timers.remove(t.0);
        }
    }
}
