//! OS-backed reactor on a readiness poller.
//!
//! Streams live in a slab indexed by the poll token; timers sit in a
//! deadline-ordered queue that bounds the poll wait. Poll events are
//! edge-style, so every opportunity that might have been missed between
//! polls (a `read_start` with data already buffered, a fresh write queue) is
//! replayed through a pending-work list at the top of each turn.
//!
//! Callbacks are only ever invoked with no internal borrow held, so host
//! code may re-enter the reactor from inside any of them.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::errno;
use crate::reactor::{
    AllocCallback, CloseCallback, ConnectionCallback, ReadCallback, Reactor, StatusCallback,
    StreamId, TimerCallback, TimerId,
};

const SUGGESTED_READ: usize = 64 * 1024;
// EINPROGRESS raw values (linux, bsd/darwin); non-blocking connect reports
// them instead of WouldBlock.
const EINPROGRESS_RAW: &[i32] = &[115, 36];

#[derive(Clone)]
struct ReadHooks {
    on_alloc: Rc<RefCell<AllocCallback>>,
    on_read: Rc<RefCell<ReadCallback>>,
}

struct WriteReq {
    bufs: Vec<Bytes>,
    seg: usize,
    off: usize,
    on_complete: StatusCallback,
}

impl WriteReq {
    /// Consume `n` accepted bytes; true once every segment is spent.
    fn advance(&mut self, mut n: usize) -> bool {
        while n > 0 && self.seg < self.bufs.len() {
            let avail = self.bufs[self.seg].len() - self.off;
            if n >= avail {
                n -= avail;
                self.seg += 1;
                self.off = 0;
            } else {
                self.off += n;
                n = 0;
            }
        }
        self.seg >= self.bufs.len()
    }

    fn slices(&self) -> Vec<IoSlice<'_>> {
        let mut out = Vec::with_capacity(self.bufs.len() - self.seg);
        for (i, buf) in self.bufs.iter().enumerate().skip(self.seg) {
            let start = if i == self.seg { self.off } else { 0 };
            out.push(IoSlice::new(&buf[start..]));
        }
        out
    }
}

struct StreamEntry {
    stream: TcpStream,
    connecting: bool,
    connect_cb: Option<StatusCallback>,
    reading: Option<ReadHooks>,
    writes: VecDeque<WriteReq>,
    shutdown_cb: Option<StatusCallback>,
}

struct ListenerEntry {
    listener: TcpListener,
    on_connection: Rc<RefCell<ConnectionCallback>>,
    accepted: VecDeque<(TcpStream, SocketAddr)>,
}

enum Entry {
    /// Registered slot with no OS socket yet.
    Vacant,
    /// Bound but neither listening nor connecting.
    Raw(Socket),
    Listener(ListenerEntry),
    Stream(StreamEntry),
    Closed,
}

struct Slot {
    entry: Entry,
    closing: bool,
    close_cb: Option<CloseCallback>,
}

struct PollTimer {
    deadline: Option<Instant>,
    on_fire: Option<TimerCallback>,
}

struct Inner {
    slots: Slab<Slot>,
    timers: Slab<PollTimer>,
    timer_queue: BTreeMap<(Instant, usize), ()>,
}

enum Pending {
    Readable(usize),
    Writable(usize),
    Close(usize),
}

pub struct PollReactor {
    poll: RefCell<Poll>,
    inner: RefCell<Inner>,
    pending: RefCell<VecDeque<Pending>>,
}

impl PollReactor {
    pub fn new() -> io::Result<Rc<Self>> {
        Ok(Rc::new(Self {
            poll: RefCell::new(Poll::new()?),
            inner: RefCell::new(Inner {
                slots: Slab::new(),
                timers: Slab::new(),
                timer_queue: BTreeMap::new(),
            }),
            pending: RefCell::new(VecDeque::new()),
        }))
    }

    /// One reactor turn: replay pending work, wait for events up to
    /// `max_wait` (clamped by the next timer deadline), dispatch, fire due
    /// timers. Returns true when anything ran.
    pub fn run_once(&self, max_wait: Option<Duration>) -> bool {
        let mut progressed = self.drain_pending();
        progressed |= self.fire_due_timers();

        let timeout = if self.pending.borrow().is_empty() {
            let until_timer = self.next_timer_gap();
            match (max_wait, until_timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            }
        } else {
            Some(Duration::ZERO)
        };

        let mut events = Events::with_capacity(256);
        let poll_ok = self
            .poll
            .borrow_mut()
            .poll(&mut events, timeout)
            .is_ok();
        if poll_ok {
            for event in events.iter() {
                let Token(idx) = event.token();
                progressed = true;
                if event.is_readable() || event.is_read_closed() {
                    self.handle_readable(idx);
                }
                if event.is_writable() || event.is_write_closed() {
                    self.handle_writable(idx);
                }
            }
        }

        progressed |= self.fire_due_timers();
        progressed |= self.drain_pending();
        progressed
    }

    // --- pending work ------------------------------------------------------

    fn drain_pending(&self) -> bool {
        let mut progressed = false;
        loop {
            let item = self.pending.borrow_mut().pop_front();
            let Some(item) = item else { break };
            progressed = true;
            match item {
                Pending::Readable(idx) => self.handle_readable(idx),
                Pending::Writable(idx) => self.handle_writable(idx),
                Pending::Close(idx) => self.handle_close(idx),
            }
        }
        progressed
    }

    fn push_pending(&self, item: Pending) {
        self.pending.borrow_mut().push_back(item);
    }

    // --- timers ------------------------------------------------------------

    fn next_timer_gap(&self) -> Option<Duration> {
        let inner = self.inner.borrow();
        let (&(deadline, _), _) = inner.timer_queue.iter().next()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    fn fire_due_timers(&self) -> bool {
        let mut fired = false;
        loop {
            let now = Instant::now();
            let due = {
                let mut inner = self.inner.borrow_mut();
                let next = inner.timer_queue.iter().next().map(|(&key, _)| key);
                match next {
                    Some((deadline, idx)) if deadline <= now => {
                        inner.timer_queue.remove(&(deadline, idx));
                        inner.timers.get_mut(idx).and_then(|t| {
                            t.deadline = None;
                            t.on_fire.take()
                        })
                    }
                    _ => None,
                }
            };
            match due {
                Some(on_fire) => {
                    fired = true;
                    on_fire();
                }
                None => break,
            }
        }
        fired
    }

    // --- event handlers ----------------------------------------------------

    fn handle_readable(&self, idx: usize) {
        enum Kind {
            Listener,
            Stream,
            Other,
        }
        let kind = {
            let inner = self.inner.borrow();
            match inner.slots.get(idx) {
                Some(slot) if !slot.closing => match slot.entry {
                    Entry::Listener(_) => Kind::Listener,
                    Entry::Stream(_) => Kind::Stream,
                    _ => Kind::Other,
                },
                _ => Kind::Other,
            }
        };
        match kind {
            Kind::Listener => self.drain_accepts(idx),
            Kind::Stream => self.drain_reads(idx),
            Kind::Other => {}
        }
    }

    fn drain_accepts(&self, idx: usize) {
        loop {
            let outcome = {
                let mut inner = self.inner.borrow_mut();
                let Some(slot) = inner.slots.get_mut(idx) else {
                    return;
                };
                let Entry::Listener(listener) = &mut slot.entry else {
                    return;
                };
                match listener.listener.accept() {
                    Ok(pair) => {
                        listener.accepted.push_back(pair);
                        Ok(Rc::clone(&listener.on_connection))
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err((Rc::clone(&listener.on_connection), errno::from_io(&e))),
                }
            };
            match outcome {
                Ok(cb) => (&mut *cb.borrow_mut())(0),
                Err((cb, code)) => {
                    (&mut *cb.borrow_mut())(code);
                    return;
                }
            }
        }
    }

    fn drain_reads(&self, idx: usize) {
        loop {
            let hooks = {
                let inner = self.inner.borrow();
                match inner.slots.get(idx) {
                    Some(slot) if !slot.closing => match &slot.entry {
                        Entry::Stream(st) => match &st.reading {
                            Some(hooks) => hooks.clone(),
                            None => return,
                        },
                        _ => return,
                    },
                    _ => return,
                }
            };
            let Some(buffer) = (&mut *hooks.on_alloc.borrow_mut())(SUGGESTED_READ) else {
                // Declined; the host already tore the read down.
                return;
            };
            let result = {
                let mut inner = self.inner.borrow_mut();
                let Some(slot) = inner.slots.get_mut(idx) else {
                    return;
                };
                let Entry::Stream(st) = &mut slot.entry else {
                    return;
                };
                let mut buf = buffer.borrow_mut();
                let dst = buf.writable();
                if dst.is_empty() {
                    None
                } else {
                    Some(st.stream.read(dst))
                }
            };
            match result {
                None => {
                    (&mut *hooks.on_read.borrow_mut())(errno::ENOBUFS as isize);
                    return;
                }
                Some(Ok(0)) => {
                    (&mut *hooks.on_read.borrow_mut())(errno::EOF as isize);
                    return;
                }
                Some(Ok(n)) => {
                    (&mut *hooks.on_read.borrow_mut())(n as isize);
                    // Keep draining; the host advanced its cursor (or
                    // stopped reading, which the next lap notices).
                }
                Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => return,
                Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Some(Err(e)) => {
                    (&mut *hooks.on_read.borrow_mut())(errno::from_io(&e) as isize);
                    return;
                }
            }
        }
    }

    fn handle_writable(&self, idx: usize) {
        // Connect completion first.
        let connect = {
            let mut inner = self.inner.borrow_mut();
            match inner.slots.get_mut(idx) {
                Some(slot) => match &mut slot.entry {
                    Entry::Stream(st) if st.connecting => {
                        let status = match st.stream.take_error() {
                            Ok(Some(e)) => Some(errno::from_io(&e)),
                            Err(e) => Some(errno::from_io(&e)),
                            Ok(None) => match st.stream.peer_addr() {
                                Ok(_) => Some(0),
                                Err(e) if e.kind() == io::ErrorKind::NotConnected => None,
                                Err(e)
                                    if EINPROGRESS_RAW
                                        .iter()
                                        .any(|c| e.raw_os_error() == Some(*c)) =>
                                {
                                    None
                                }
                                Err(e) => Some(errno::from_io(&e)),
                            },
                        };
                        match status {
                            Some(code) => {
                                st.connecting = false;
                                st.connect_cb.take().map(|cb| (cb, code))
                            }
                            None => None,
                        }
                    }
                    _ => None,
                },
                None => None,
            }
        };
        if let Some((cb, status)) = connect {
            cb(status);
        }
        self.flush_writes(idx);
    }

    fn flush_writes(&self, idx: usize) {
        enum Outcome {
            Completed(StatusCallback),
            Failed(StatusCallback, i32),
            ShutdownDone(StatusCallback, i32),
            Blocked,
            Idle,
        }
        loop {
            let outcome = {
                let mut inner = self.inner.borrow_mut();
                let Some(slot) = inner.slots.get_mut(idx) else {
                    return;
                };
                if slot.closing {
                    return;
                }
                let Entry::Stream(st) = &mut slot.entry else {
                    return;
                };
                if st.connecting {
                    Outcome::Idle
                } else if let Some(front) = st.writes.front_mut() {
                    let slices = front.slices();
                    match st.stream.write_vectored(&slices) {
                        Ok(n) => {
                            drop(slices);
                            if front.advance(n) {
                                let req = st.writes.pop_front();
                                match req {
                                    Some(req) => Outcome::Completed(req.on_complete),
                                    None => Outcome::Idle,
                                }
                            } else {
                                continue;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Blocked,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let code = errno::from_io(&e);
                            match st.writes.pop_front() {
                                Some(req) => Outcome::Failed(req.on_complete, code),
                                None => Outcome::Idle,
                            }
                        }
                    }
                } else if let Some(cb) = st.shutdown_cb.take() {
                    let code = match st.stream.shutdown(Shutdown::Write) {
                        Ok(()) => 0,
                        Err(e) => errno::from_io(&e),
                    };
                    Outcome::ShutdownDone(cb, code)
                } else {
                    Outcome::Idle
                }
            };
            match outcome {
                Outcome::Completed(cb) => cb(0),
                Outcome::Failed(cb, code) => cb(code),
                Outcome::ShutdownDone(cb, code) => {
                    cb(code);
                    return;
                }
                Outcome::Blocked | Outcome::Idle => return,
            }
        }
    }

    fn handle_close(&self, idx: usize) {
        let registry_poll = self.poll.borrow();
        let registry = registry_poll.registry();
        let (cancels, close_cb) = {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slots.get_mut(idx) else {
                return;
            };
            let mut cancels: Vec<StatusCallback> = Vec::new();
            match std::mem::replace(&mut slot.entry, Entry::Closed) {
                Entry::Stream(mut st) => {
                    if let Some(cb) = st.connect_cb.take() {
                        cancels.push(cb);
                    }
                    for req in st.writes.drain(..) {
                        cancels.push(req.on_complete);
                    }
                    if let Some(cb) = st.shutdown_cb.take() {
                        cancels.push(cb);
                    }
                    let _ = registry.deregister(&mut st.stream);
                }
                Entry::Listener(mut listener) => {
                    let _ = registry.deregister(&mut listener.listener);
                }
                Entry::Raw(_) | Entry::Vacant | Entry::Closed => {}
            }
            (cancels, slot.close_cb.take())
        };
        drop(registry_poll);
        for cb in cancels {
            cb(errno::ECANCELED);
        }
        if let Some(cb) = close_cb {
            cb();
        }
    }

    // --- socket construction ------------------------------------------------

    fn raw_socket_for(addr: SocketAddr) -> io::Result<Socket> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        Ok(socket)
    }

    fn register_stream(&self, idx: usize, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.borrow().registry().register(
            stream,
            Token(idx),
            Interest::READABLE | Interest::WRITABLE,
        )
    }
}

impl Reactor for PollReactor {
    fn stream_init(&self) -> Result<StreamId, i32> {
        let idx = self.inner.borrow_mut().slots.insert(Slot {
            entry: Entry::Vacant,
            closing: false,
            close_cb: None,
        });
        Ok(StreamId(idx))
    }

    fn tcp_bind(&self, s: StreamId, addr: SocketAddr, reuse_port: bool) -> i32 {
        let socket = match Self::raw_socket_for(addr) {
            Ok(socket) => socket,
            Err(e) => return errno::from_io(&e),
        };
        #[cfg(unix)]
        if reuse_port {
            if let Err(e) = socket.set_reuse_port(true) {
                return errno::from_io(&e);
            }
        }
        #[cfg(not(unix))]
        let _ = reuse_port;
        if let Err(e) = socket.bind(&addr.into()) {
            return errno::from_io(&e);
        }
        let mut inner = self.inner.borrow_mut();
        match inner.slots.get_mut(s.0) {
            Some(slot) if matches!(slot.entry, Entry::Vacant) && !slot.closing => {
                slot.entry = Entry::Raw(socket);
                0
            }
            _ => errno::EINVAL,
        }
    }

    fn listen(&self, s: StreamId, backlog: i32, on_connection: ConnectionCallback) -> i32 {
        let socket = {
            let mut inner = self.inner.borrow_mut();
            match inner.slots.get_mut(s.0) {
                Some(slot) if !slot.closing => match std::mem::replace(&mut slot.entry, Entry::Vacant) {
                    Entry::Raw(socket) => Some(socket),
                    Entry::Vacant => None,
                    other => {
                        slot.entry = other;
                        return errno::EINVAL;
                    }
                },
                _ => return errno::EINVAL,
            }
        };
        let socket = match socket {
            Some(socket) => socket,
            None => {
                // Implicit bind to an ephemeral port, as the OS would do.
                let addr = SocketAddr::from(([0, 0, 0, 0], 0));
                let socket = match Self::raw_socket_for(addr) {
                    Ok(socket) => socket,
                    Err(e) => return errno::from_io(&e),
                };
                if let Err(e) = socket.bind(&addr.into()) {
                    return errno::from_io(&e);
                }
                socket
            }
        };
        if let Err(e) = socket.listen(backlog.max(1)) {
            return errno::from_io(&e);
        }
        let mut listener = TcpListener::from_std(socket.into());
        if let Err(e) = self
            .poll
            .borrow()
            .registry()
            .register(&mut listener, Token(s.0), Interest::READABLE)
        {
            return errno::from_io(&e);
        }
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.slots.get_mut(s.0) {
            slot.entry = Entry::Listener(ListenerEntry {
                listener,
                on_connection: Rc::new(RefCell::new(on_connection)),
                accepted: VecDeque::new(),
            });
        }
        0
    }

    fn accept(&self, server: StreamId, child: StreamId) -> i32 {
        let pair = {
            let mut inner = self.inner.borrow_mut();
            match inner.slots.get_mut(server.0) {
                Some(slot) => match &mut slot.entry {
                    Entry::Listener(listener) => listener.accepted.pop_front(),
                    _ => return errno::EINVAL,
                },
                None => return errno::EINVAL,
            }
        };
        let Some((mut stream, _peer)) = pair else {
            return errno::EAGAIN;
        };
        if let Err(e) = self.register_stream(child.0, &mut stream) {
            return errno::from_io(&e);
        }
        let mut inner = self.inner.borrow_mut();
        match inner.slots.get_mut(child.0) {
            Some(slot) if matches!(slot.entry, Entry::Vacant) => {
                slot.entry = Entry::Stream(StreamEntry {
                    stream,
                    connecting: false,
                    connect_cb: None,
                    reading: None,
                    writes: VecDeque::new(),
                    shutdown_cb: None,
                });
                0
            }
            _ => errno::EINVAL,
        }
    }

    fn connect(&self, s: StreamId, addr: SocketAddr, on_complete: StatusCallback) -> i32 {
        let socket = {
            let mut inner = self.inner.borrow_mut();
            match inner.slots.get_mut(s.0) {
                Some(slot) if !slot.closing => {
                    match std::mem::replace(&mut slot.entry, Entry::Vacant) {
                        Entry::Raw(socket) => Some(socket),
                        Entry::Vacant => None,
                        other => {
                            slot.entry = other;
                            return errno::EINVAL;
                        }
                    }
                }
                _ => return errno::EINVAL,
            }
        };
        let socket = match socket {
            Some(socket) => socket,
            None => match Self::raw_socket_for(addr) {
                Ok(socket) => socket,
                Err(e) => return errno::from_io(&e),
            },
        };
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e)
                if EINPROGRESS_RAW
                    .iter()
                    .any(|c| e.raw_os_error() == Some(*c)) => {}
            Err(e) => return errno::from_io(&e),
        }
        let mut stream = TcpStream::from_std(socket.into());
        if let Err(e) = self.register_stream(s.0, &mut stream) {
            return errno::from_io(&e);
        }
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.slots.get_mut(s.0) {
                slot.entry = Entry::Stream(StreamEntry {
                    stream,
                    connecting: true,
                    connect_cb: Some(on_complete),
                    reading: None,
                    writes: VecDeque::new(),
                    shutdown_cb: None,
                });
            }
        }
        // Loopback connects may already be writable; check without waiting
        // for an edge.
        self.push_pending(Pending::Writable(s.0));
        0
    }

    fn read_start(&self, s: StreamId, on_alloc: AllocCallback, on_read: ReadCallback) -> i32 {
        {
            let mut inner = self.inner.borrow_mut();
            match inner.slots.get_mut(s.0) {
                Some(slot) if !slot.closing => match &mut slot.entry {
                    Entry::Stream(st) => {
                        st.reading = Some(ReadHooks {
                            on_alloc: Rc::new(RefCell::new(on_alloc)),
                            on_read: Rc::new(RefCell::new(on_read)),
                        });
                    }
                    _ => return errno::ENOTCONN,
                },
                _ => return errno::EINVAL,
            }
        }
        // Data may already be buffered from before this read.
        self.push_pending(Pending::Readable(s.0));
        0
    }

    fn read_stop(&self, s: StreamId) -> i32 {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.slots.get_mut(s.0) {
            if let Entry::Stream(st) = &mut slot.entry {
                st.reading = None;
            }
        }
        0
    }

    fn try_write(&self, s: StreamId, bufs: &[IoSlice<'_>]) -> isize {
        let mut inner = self.inner.borrow_mut();
        let Some(slot) = inner.slots.get_mut(s.0) else {
            return errno::EINVAL as isize;
        };
        if slot.closing {
            return errno::EPIPE as isize;
        }
        let Entry::Stream(st) = &mut slot.entry else {
            return errno::ENOTCONN as isize;
        };
        if st.connecting {
            return errno::ENOTCONN as isize;
        }
        if !st.writes.is_empty() {
            // Queued writes must keep their order; no fast path past them.
            return errno::EAGAIN as isize;
        }
        match st.stream.write_vectored(bufs) {
            Ok(n) => n as isize,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => errno::EAGAIN as isize,
            Err(e) => errno::from_io(&e) as isize,
        }
    }

    fn write2(&self, s: StreamId, bufs: Vec<Bytes>, on_complete: StatusCallback) -> i32 {
        {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slots.get_mut(s.0) else {
                return errno::EINVAL;
            };
            if slot.closing {
                return errno::EPIPE;
            }
            let Entry::Stream(st) = &mut slot.entry else {
                return errno::ENOTCONN;
            };
            st.writes.push_back(WriteReq {
                bufs,
                seg: 0,
                off: 0,
                on_complete,
            });
        }
        self.push_pending(Pending::Writable(s.0));
        0
    }

    fn shutdown(&self, s: StreamId, on_complete: StatusCallback) -> i32 {
        {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slots.get_mut(s.0) else {
                return errno::EINVAL;
            };
            if slot.closing {
                return errno::EPIPE;
            }
            let Entry::Stream(st) = &mut slot.entry else {
                return errno::ENOTCONN;
            };
            if st.shutdown_cb.is_some() {
                return errno::EBUSY;
            }
            st.shutdown_cb = Some(on_complete);
        }
        self.push_pending(Pending::Writable(s.0));
        0
    }

    fn close(&self, s: StreamId, on_close: Option<CloseCallback>) {
        {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slots.get_mut(s.0) else {
                return;
            };
            slot.closing = true;
            slot.close_cb = on_close;
        }
        self.push_pending(Pending::Close(s.0));
    }

    fn is_closing(&self, s: StreamId) -> bool {
        let inner = self.inner.borrow();
        inner
            .slots
            .get(s.0)
            .is_some_and(|slot| slot.closing || matches!(slot.entry, Entry::Closed))
    }

    fn tcp_nodelay(&self, s: StreamId, enable: bool) -> i32 {
        let inner = self.inner.borrow();
        let result = match inner.slots.get(s.0).map(|slot| &slot.entry) {
            Some(Entry::Stream(st)) => st.stream.set_nodelay(enable),
            Some(Entry::Raw(socket)) => socket.set_nodelay(enable),
            _ => return errno::EINVAL,
        };
        match result {
            Ok(()) => 0,
            Err(e) => errno::from_io(&e),
        }
    }

    #[cfg(unix)]
    fn tcp_keepalive(&self, s: StreamId, enable: bool, delay_secs: u32) -> i32 {
        use socket2::TcpKeepalive;
        use std::os::fd::{AsRawFd, FromRawFd};

        let inner = self.inner.borrow();
        let fd = match inner.slots.get(s.0).map(|slot| &slot.entry) {
            Some(Entry::Stream(st)) => st.stream.as_raw_fd(),
            Some(Entry::Raw(socket)) => socket.as_raw_fd(),
            _ => return errno::EINVAL,
        };
        // Borrow the descriptor without adopting it; the forget below keeps
        // the real owner's close intact.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let result = if enable {
            let params = TcpKeepalive::new().with_time(Duration::from_secs(u64::from(delay_secs)));
            socket
                .set_keepalive(true)
                .and_then(|()| socket.set_tcp_keepalive(&params))
        } else {
            socket.set_keepalive(false)
        };
        std::mem::forget(socket);
        match result {
            Ok(()) => 0,
            Err(e) => errno::from_io(&e),
        }
    }

    #[cfg(not(unix))]
    fn tcp_keepalive(&self, _s: StreamId, _enable: bool, _delay_secs: u32) -> i32 {
        errno::ENOSYS
    }

    fn getsockname(&self, s: StreamId) -> Result<SocketAddr, i32> {
        let inner = self.inner.borrow();
        match inner.slots.get(s.0).map(|slot| &slot.entry) {
            Some(Entry::Stream(st)) => st.stream.local_addr().map_err(|e| errno::from_io(&e)),
            Some(Entry::Listener(l)) => l.listener.local_addr().map_err(|e| errno::from_io(&e)),
            Some(Entry::Raw(socket)) => socket
                .local_addr()
                .map_err(|e| errno::from_io(&e))
                .and_then(|addr| addr.as_socket().ok_or(errno::EINVAL)),
            _ => Err(errno::EINVAL),
        }
    }

    fn getpeername(&self, s: StreamId) -> Result<SocketAddr, i32> {
        let inner = self.inner.borrow();
        match inner.slots.get(s.0).map(|slot| &slot.entry) {
            Some(Entry::Stream(st)) => st.stream.peer_addr().map_err(|e| errno::from_io(&e)),
            _ => Err(errno::ENOTCONN),
        }
    }

    #[cfg(unix)]
    fn fd(&self, s: StreamId) -> i32 {
        use std::os::fd::AsRawFd;

        let inner = self.inner.borrow();
        match inner.slots.get(s.0).map(|slot| &slot.entry) {
            Some(Entry::Stream(st)) => st.stream.as_raw_fd(),
            Some(Entry::Listener(l)) => l.listener.as_raw_fd(),
            Some(Entry::Raw(socket)) => socket.as_raw_fd(),
            _ => errno::EINVAL,
        }
    }

    #[cfg(not(unix))]
    fn fd(&self, _s: StreamId) -> i32 {
        errno::ENOSYS
    }

    fn timer_init(&self) -> Result<TimerId, i32> {
        let idx = self.inner.borrow_mut().timers.insert(PollTimer {
            deadline: None,
            on_fire: None,
        });
        Ok(TimerId(idx))
    }

    fn timer_start(&self, t: TimerId, timeout_ms: u64, on_fire: TimerCallback) -> i32 {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut inner = self.inner.borrow_mut();
        let previous = match inner.timers.get_mut(t.0) {
            Some(timer) => {
                let previous = timer.deadline.replace(deadline);
                timer.on_fire = Some(on_fire);
                previous
            }
            None => return errno::EINVAL,
        };
        if let Some(previous) = previous {
            inner.timer_queue.remove(&(previous, t.0));
        }
        inner.timer_queue.insert((deadline, t.0), ());
        0
    }

    fn timer_stop(&self, t: TimerId) -> i32 {
        let mut inner = self.inner.borrow_mut();
        if let Some(timer) = inner.timers.get_mut(t.0) {
            let deadline = timer.deadline.take();
            timer.on_fire = None;
            if let Some(deadline) = deadline {
                inner.timer_queue.remove(&(deadline, t.0));
            }
        }
        0
    }

    fn timer_release(&self, t: TimerId) {
        self.timer_stop(t);
        let mut inner = self.inner.borrow_mut();
        if inner.timers.contains(t.0) {
            inner.timers.remove(t.0);
        }
    }
}
