//! TCP socket objects.
//!
//! A [`TcpSocket`] is the host-visible handle: it owns the reactor stream,
//! the per-socket deadline setting, the anchors that keep host values alive
//! across suspensions, and the bookkeeping that ties one in-flight operation
//! to the coroutine waiting on it. The launch functions here submit work to
//! the reactor and install the completion/timeout handlers; the validation
//! layer in [`crate::ops`] sits in front of them.
//!
//! Every handler follows the same shape: gather what it needs inside a short
//! borrow of the socket, release the borrow, then touch the reactor and
//! resume the coroutine. Resuming runs script code, which may re-enter the
//! socket through any operation, so no borrow may be held across it.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::adapter::WriteBatch;
use crate::arena::{ReqId, RequestBlock};
use crate::buffer::ReadBuffer;
use crate::errno;
use crate::host::{CoroutineRef, HostValue, Resume};
use crate::ops::Op;
use crate::reactor::{
    AllocCallback, CloseCallback, ConnectionCallback, ReadCallback, StatusCallback, StreamId,
    TimerCallback,
};
use crate::registry::Anchor;
use crate::runtime::Runtime;

/// Shared handle to a socket, as held by the host and by reactor callbacks.
pub type SocketRef = Rc<RefCell<TcpSocket>>;

/// How the socket came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uninit,
    Client,
    ServerListening,
    ServerAccepted,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninit,
    Bound,
    Listening,
    Connecting,
    Established,
    ShuttingDown,
    Closing,
    Closed,
}

/// The operation kinds that may hold the socket's single in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Connect,
    Read,
    Write,
    Shutdown,
    Close,
}

pub struct TcpSocket {
    pub(crate) rt: Rc<Runtime>,
    pub(crate) stream: StreamId,
    pub(crate) role: Role,
    pub(crate) state: SocketState,
    pub(crate) timeout_ms: u64,
    /// The coroutine that created the socket; accept handlers spawn from it.
    pub(crate) owning_coroutine: Option<CoroutineRef>,
    /// The coroutine suspended inside the current operation, if any.
    pub(crate) current_coroutine: Option<CoroutineRef>,
    /// Weak link to the host-owned read buffer.
    pub(crate) read_buffer: Option<Weak<RefCell<ReadBuffer>>>,
    /// Read-deadline timer; connect/write deadlines live on their request.
    pub(crate) pending_timer: Option<crate::reactor::TimerId>,
    pub(crate) inflight: Option<OpKind>,
    pub(crate) on_connect_anchor: Option<Anchor>,
    pub(crate) coroutine_anchor: Option<Anchor>,
    pub(crate) closing: bool,
}

impl TcpSocket {
    /// Create an uninitialized socket. With `anchor_coroutine`, the calling
    /// coroutine is pinned in the registry so accept handlers can reach it
    /// after the creating frame has returned (servers).
    pub(crate) fn create(
        rt: &Rc<Runtime>,
        co: &CoroutineRef,
        anchor_coroutine: bool,
    ) -> Result<SocketRef, i32> {
        let stream = rt.reactor().stream_init()?;
        let coroutine_anchor = if anchor_coroutine {
            Some(rt.registry().anchor(HostValue::Coroutine(co.clone())))
        } else {
            None
        };
        Ok(Rc::new(RefCell::new(Self {
            rt: Rc::clone(rt),
            stream,
            role: Role::Uninit,
            state: SocketState::Uninit,
            timeout_ms: 0,
            owning_coroutine: Some(co.clone()),
            current_coroutine: None,
            read_buffer: None,
            pending_timer: None,
            inflight: None,
            on_connect_anchor: None,
            coroutine_anchor,
            closing: false,
        })))
    }

    fn accepted(
        rt: &Rc<Runtime>,
        stream: StreamId,
        co: &CoroutineRef,
        coroutine_anchor: Anchor,
        timeout_ms: u64,
    ) -> SocketRef {
        Rc::new(RefCell::new(Self {
            rt: Rc::clone(rt),
            stream,
            role: Role::ServerAccepted,
            state: SocketState::Established,
            timeout_ms,
            owning_coroutine: Some(co.clone()),
            current_coroutine: None,
            read_buffer: None,
            pending_timer: None,
            inflight: None,
            on_connect_anchor: None,
            coroutine_anchor: Some(coroutine_anchor),
            closing: false,
        }))
    }

    #[must_use]
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Reactor handle of this socket, for reactor-level introspection.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// End the in-flight operation of `kind`, handing back its waiter.
    /// No-op when a different operation holds the slot.
    fn conclude(&mut self, kind: OpKind) -> Option<CoroutineRef> {
        if self.inflight == Some(kind) {
            self.inflight = None;
            self.current_coroutine.take()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// listen / accept

pub(crate) fn start_listen(sock: &SocketRef, on_connect: HostValue, backlog: i32) -> i32 {
    let rt = sock.borrow().rt.clone();
    let stream = sock.borrow().stream;
    sock.borrow_mut().on_connect_anchor = Some(rt.registry().anchor(on_connect));

    let on_connection: ConnectionCallback = {
        let rt = Rc::clone(&rt);
        let sock = Rc::clone(sock);
        Box::new(move |status| accept_incoming(&rt, &sock, status))
    };
    let status = rt.reactor().listen(stream, backlog, on_connection);

    let mut s = sock.borrow_mut();
    if status == 0 {
        s.state = SocketState::Listening;
        s.role = Role::ServerListening;
    } else {
        s.on_connect_anchor = None;
    }
    status
}

/// One incoming connection on a listener. Failures never reach the host:
/// they are logged and the listener keeps running.
fn accept_incoming(rt: &Rc<Runtime>, server: &SocketRef, status: i32) {
    if status < 0 {
        tracing::error!(status, "server onconnect error: {}", errno::describe(status));
        return;
    }
    let (owner, entry, timeout_ms, server_stream) = {
        let s = server.borrow();
        (
            s.owning_coroutine.clone(),
            s.on_connect_anchor.as_ref().and_then(Anchor::value),
            s.timeout_ms,
            s.stream,
        )
    };
    let (Some(owner), Some(entry)) = (owner, entry) else {
        return;
    };

    let co = rt.scheduler().spawn(&owner, &entry);
    let anchor = rt.registry().anchor(HostValue::Coroutine(co.clone()));

    let child_stream = match rt.reactor().stream_init() {
        Ok(id) => id,
        Err(code) => {
            drop(anchor);
            tracing::error!("server onconnect error: {}", errno::describe(code));
            return;
        }
    };
    let err = rt.reactor().accept(server_stream, child_stream);
    if err != 0 {
        rt.reactor().close(child_stream, None);
        drop(anchor);
        tracing::error!("server onconnect error: {}", errno::describe(err));
        return;
    }

    let child = TcpSocket::accepted(rt, child_stream, &co, anchor, timeout_ms);
    co.resume(Resume::Socket(child));
}

// ---------------------------------------------------------------------------
// connect

pub(crate) fn start_connect(sock: &SocketRef, co: &CoroutineRef, addr: SocketAddr) -> Op {
    let (rt, stream, timeout_ms, prev_state) = {
        let s = sock.borrow();
        (s.rt.clone(), s.stream, s.timeout_ms, s.state)
    };

    let timer = if timeout_ms > 0 {
        match rt.timers().acquire() {
            Some(t) => Some(t),
            None => return Op::Complete(Resume::Int(i64::from(errno::ENOMEM))),
        }
    } else {
        None
    };

    let mut block = RequestBlock::new(OpKind::Connect, Some(co.clone()));
    block.timer = timer;
    block.restore_state = Some(prev_state);
    let Some(req) = rt.arena().alloc(block) else {
        if let Some(t) = timer {
            rt.timers().disarm_and_release(t);
        }
        return Op::Complete(Resume::Int(i64::from(errno::ENOMEM)));
    };

    let on_complete: StatusCallback = {
        let rt = Rc::clone(&rt);
        let sock = Rc::clone(sock);
        Box::new(move |status| connect_complete(&rt, &sock, req, status))
    };
    let status = rt.reactor().connect(stream, addr, on_complete);
    if status != 0 {
        tracing::debug!(status, "connect submit failed: {}", errno::describe(status));
        if let Some(t) = timer {
            rt.timers().disarm_and_release(t);
        }
        let _ = rt.arena().free(req);
        return Op::Complete(Resume::Int(i64::from(status)));
    }

    {
        let mut s = sock.borrow_mut();
        s.state = SocketState::Connecting;
        s.current_coroutine = Some(co.clone());
        s.inflight = Some(OpKind::Connect);
    }
    if let Some(t) = timer {
        let on_fire: TimerCallback = {
            let rt = Rc::clone(&rt);
            let sock = Rc::clone(sock);
            Box::new(move || connect_timed_out(&rt, &sock, req))
        };
        rt.timers().arm(t, timeout_ms, on_fire);
    }
    Op::Yield
}

fn connect_complete(rt: &Rc<Runtime>, sock: &SocketRef, req: ReqId, status: i32) {
    let Some(block) = rt.arena().free(req) else {
        return;
    };
    if let Some(t) = block.timer {
        rt.timers().disarm_and_release(t);
    }
    if block.timed_out {
        // The deadline already resumed the coroutine; only the request block
        // was left to tear down.
        return;
    }
    {
        let mut s = sock.borrow_mut();
        if !s.closing {
            if status == 0 {
                s.state = SocketState::Established;
                s.role = Role::Client;
            } else if let Some(prev) = block.restore_state {
                s.state = prev;
            }
        }
        let _ = s.conclude(OpKind::Connect);
    }
    if let Some(co) = &block.coroutine {
        co.resume(Resume::Int(i64::from(status)));
    }
}

fn connect_timed_out(rt: &Rc<Runtime>, sock: &SocketRef, req: ReqId) {
    tracing::trace!("connect deadline expired");
    let Some((timer, co, restore)) = rt.arena().with(req, |block| {
        block.timed_out = true;
        (block.timer.take(), block.coroutine.clone(), block.restore_state)
    }) else {
        return;
    };
    if let Some(t) = timer {
        rt.timers().release_fired(t);
    }
    {
        let mut s = sock.borrow_mut();
        if !s.closing {
            if let Some(prev) = restore {
                s.state = prev;
            }
        }
        let _ = s.conclude(OpKind::Connect);
    }
    if let Some(co) = co {
        co.resume(Resume::Int(i64::from(errno::ETIMEDOUT)));
    }
}

// ---------------------------------------------------------------------------
// read

pub(crate) fn start_read(sock: &SocketRef, co: &CoroutineRef) -> Op {
    let (rt, stream, timeout_ms) = {
        let s = sock.borrow();
        (s.rt.clone(), s.stream, s.timeout_ms)
    };

    let timer = if timeout_ms > 0 {
        match rt.timers().acquire() {
            Some(t) => Some(t),
            None => return Op::Complete(Resume::Int(i64::from(errno::ENOMEM))),
        }
    } else {
        None
    };

    let on_alloc: AllocCallback = {
        let rt = Rc::clone(&rt);
        let sock = Rc::clone(sock);
        Box::new(move |_suggested| {
            let buffer = sock.borrow().read_buffer.as_ref().and_then(Weak::upgrade);
            let Some(buffer) = buffer else {
                read_failed(&rt, &sock, errno::ENOMEM);
                return None;
            };
            let outcome = buffer.borrow_mut().ensure_allocated(rt.pool());
            match outcome {
                Ok(()) => Some(buffer),
                Err(code) => {
                    read_failed(&rt, &sock, code);
                    None
                }
            }
        })
    };
    let on_read_cb: ReadCallback = {
        let rt = Rc::clone(&rt);
        let sock = Rc::clone(sock);
        Box::new(move |nread| on_read(&rt, &sock, nread))
    };

    let status = rt.reactor().read_start(stream, on_alloc, on_read_cb);
    if status != 0 {
        if let Some(t) = timer {
            rt.timers().disarm_and_release(t);
        }
        return Op::Complete(Resume::Int(i64::from(status)));
    }

    {
        let mut s = sock.borrow_mut();
        s.pending_timer = timer;
        s.current_coroutine = Some(co.clone());
        s.inflight = Some(OpKind::Read);
    }
    if let Some(t) = timer {
        let on_fire: TimerCallback = {
            let rt = Rc::clone(&rt);
            let sock = Rc::clone(sock);
            Box::new(move || read_timed_out(&rt, &sock))
        };
        rt.timers().arm(t, timeout_ms, on_fire);
    }
    Op::Yield
}

fn on_read(rt: &Rc<Runtime>, sock: &SocketRef, nread: isize) {
    if nread == 0 {
        // Nothing this round; the kernel keeps reading.
        return;
    }
    let (stream, timer, co, buffer) = {
        let mut s = sock.borrow_mut();
        let stream = s.stream;
        let timer = s.pending_timer.take();
        let co = s.conclude(OpKind::Read);
        let buffer = if nread > 0 {
            s.read_buffer.as_ref().and_then(Weak::upgrade)
        } else {
            None
        };
        (stream, timer, co, buffer)
    };
    rt.reactor().read_stop(stream);
    if let Some(t) = timer {
        rt.timers().disarm_and_release(t);
    }
    if let Some(buffer) = buffer {
        buffer.borrow_mut().advance_write(nread as usize);
    }
    if let Some(co) = co {
        co.resume(Resume::Int(nread as i64));
    }
}

/// Read teardown for failures raised on this side of the reactor (buffer
/// gone, pool exhausted).
fn read_failed(rt: &Rc<Runtime>, sock: &SocketRef, code: i32) {
    let (stream, timer, co) = {
        let mut s = sock.borrow_mut();
        (s.stream, s.pending_timer.take(), s.conclude(OpKind::Read))
    };
    rt.reactor().read_stop(stream);
    if let Some(t) = timer {
        rt.timers().disarm_and_release(t);
    }
    if let Some(co) = co {
        co.resume(Resume::Int(i64::from(code)));
    }
}

fn read_timed_out(rt: &Rc<Runtime>, sock: &SocketRef) {
    tracing::trace!("read deadline expired");
    let (stream, timer, co) = {
        let mut s = sock.borrow_mut();
        (s.stream, s.pending_timer.take(), s.conclude(OpKind::Read))
    };
    rt.reactor().read_stop(stream);
    if let Some(t) = timer {
        rt.timers().release_fired(t);
    }
    if let Some(co) = co {
        co.resume(Resume::Int(i64::from(errno::ETIMEDOUT)));
    }
}

// ---------------------------------------------------------------------------
// write / write_async

/// Launch a write. With a waiter the coroutine yields and is resumed with
/// `(bytes, status)`; without one the remainder is submitted fire-and-forget
/// and the caller gets `(total, 0)` back synchronously.
pub(crate) fn start_write(
    sock: &SocketRef,
    waiter: Option<&CoroutineRef>,
    data: &HostValue,
    mut batch: WriteBatch,
) -> Op {
    let (rt, stream, timeout_ms) = {
        let s = sock.borrow();
        (s.rt.clone(), s.stream, s.timeout_ms)
    };
    let total = batch.total;

    let mut written = 0usize;
    if !batch.is_empty() {
        let outcome = {
            let slices = batch.as_io_slices();
            rt.reactor().try_write(stream, &slices)
        };
        if outcome >= 0 {
            written = outcome as usize;
            batch.trim(written);
        } else {
            let code = outcome as i32;
            if code != errno::EAGAIN && code != errno::ENOSYS {
                return Op::Complete(Resume::Pair(0, i64::from(code)));
            }
        }
    }
    if batch.is_empty() {
        // The non-blocking attempt took everything; no suspension.
        return Op::Complete(Resume::Pair(written as i64, 0));
    }

    let timer = if timeout_ms > 0 {
        match rt.timers().acquire() {
            Some(t) => Some(t),
            None => {
                return Op::Complete(Resume::Pair(written as i64, i64::from(errno::ENOMEM)))
            }
        }
    } else {
        None
    };

    let mut block = RequestBlock::new(OpKind::Write, waiter.cloned());
    block.timer = timer;
    block.bytes = total;
    block.payload = Some(rt.registry().anchor(data.clone()));
    let Some(req) = rt.arena().alloc(block) else {
        if let Some(t) = timer {
            rt.timers().disarm_and_release(t);
        }
        return Op::Complete(Resume::Pair(written as i64, i64::from(errno::ENOMEM)));
    };

    let on_complete: StatusCallback = {
        let rt = Rc::clone(&rt);
        let sock = Rc::clone(sock);
        Box::new(move |status| after_write(&rt, &sock, req, status))
    };
    let bufs: Vec<Bytes> = batch.segments.iter().cloned().collect();
    let status = rt.reactor().write2(stream, bufs, on_complete);
    if status != 0 {
        tracing::debug!(status, "write submit failed: {}", errno::describe(status));
        if let Some(t) = timer {
            rt.timers().disarm_and_release(t);
        }
        let _ = rt.arena().free(req);
        return Op::Complete(Resume::Pair(written as i64, i64::from(status)));
    }

    if let Some(t) = timer {
        let on_fire: TimerCallback = if waiter.is_some() {
            let rt = Rc::clone(&rt);
            let sock = Rc::clone(sock);
            Box::new(move || write_timed_out(&rt, &sock, req))
        } else {
            let rt = Rc::clone(&rt);
            Box::new(move || write_async_timed_out(&rt, req))
        };
        rt.timers().arm(t, timeout_ms, on_fire);
    }

    match waiter {
        Some(co) => {
            let mut s = sock.borrow_mut();
            s.current_coroutine = Some(co.clone());
            s.inflight = Some(OpKind::Write);
            drop(s);
            Op::Yield
        }
        None => Op::Complete(Resume::Pair(total as i64, 0)),
    }
}

fn after_write(rt: &Rc<Runtime>, sock: &SocketRef, req: ReqId, status: i32) {
    let Some(block) = rt.arena().free(req) else {
        // A fire-and-forget deadline already tore the request down.
        return;
    };
    if let Some(t) = block.timer {
        rt.timers().disarm_and_release(t);
    }
    let RequestBlock {
        coroutine,
        timed_out,
        bytes,
        payload,
        ..
    } = block;
    drop(payload);
    let Some(co) = coroutine else {
        return;
    };
    if timed_out {
        return;
    }
    {
        let mut s = sock.borrow_mut();
        let _ = s.conclude(OpKind::Write);
    }
    let delivered = if status == 0 { bytes as i64 } else { 0 };
    co.resume(Resume::Pair(delivered, i64::from(status)));
}

fn write_timed_out(rt: &Rc<Runtime>, sock: &SocketRef, req: ReqId) {
    tracing::trace!("write deadline expired");
    let Some((timer, co)) = rt.arena().with(req, |block| {
        block.timed_out = true;
        (block.timer.take(), block.coroutine.clone())
    }) else {
        return;
    };
    if let Some(t) = timer {
        rt.timers().release_fired(t);
    }
    {
        let mut s = sock.borrow_mut();
        let _ = s.conclude(OpKind::Write);
    }
    if let Some(co) = co {
        co.resume(Resume::Pair(0, i64::from(errno::ETIMEDOUT)));
    }
}

/// Deadline of a fire-and-forget write: nobody to resume, so the whole
/// request is torn down here and the late completion finds a stale id.
fn write_async_timed_out(rt: &Rc<Runtime>, req: ReqId) {
    tracing::trace!("async write deadline expired");
    let Some(block) = rt.arena().free(req) else {
        return;
    };
    if let Some(t) = block.timer {
        rt.timers().release_fired(t);
    }
}

// ---------------------------------------------------------------------------
// shutdown

pub(crate) fn start_shutdown(sock: &SocketRef, co: &CoroutineRef) -> Op {
    let (rt, stream) = {
        let s = sock.borrow();
        (s.rt.clone(), s.stream)
    };
    let Some(req) = rt
        .arena()
        .alloc(RequestBlock::new(OpKind::Shutdown, Some(co.clone())))
    else {
        return Op::Complete(Resume::Int(i64::from(errno::ENOMEM)));
    };

    let on_complete: StatusCallback = {
        let rt = Rc::clone(&rt);
        let sock = Rc::clone(sock);
        Box::new(move |status| after_shutdown(&rt, &sock, req, status))
    };
    let status = rt.reactor().shutdown(stream, on_complete);
    if status != 0 {
        let _ = rt.arena().free(req);
        return Op::Complete(Resume::Int(i64::from(status)));
    }

    let mut s = sock.borrow_mut();
    s.state = SocketState::ShuttingDown;
    s.current_coroutine = Some(co.clone());
    s.inflight = Some(OpKind::Shutdown);
    drop(s);
    Op::Yield
}

fn after_shutdown(rt: &Rc<Runtime>, sock: &SocketRef, req: ReqId, status: i32) {
    let Some(block) = rt.arena().free(req) else {
        return;
    };
    {
        let mut s = sock.borrow_mut();
        let _ = s.conclude(OpKind::Shutdown);
    }
    if let Some(co) = &block.coroutine {
        co.resume(Resume::Int(i64::from(status)));
    }
}

// ---------------------------------------------------------------------------
// close

pub(crate) fn start_close(sock: &SocketRef, co: &CoroutineRef) -> Op {
    let (rt, stream, canceled_read) = {
        let mut s = sock.borrow_mut();
        let rt = s.rt.clone();
        let stream = s.stream;
        s.closing = true;
        s.state = SocketState::Closing;
        let canceled_read = if s.inflight == Some(OpKind::Read) {
            let timer = s.pending_timer.take();
            let reader = s.conclude(OpKind::Read);
            Some((timer, reader))
        } else {
            None
        };
        (rt, stream, canceled_read)
    };

    // A read parked on this socket cannot complete once the stream goes
    // away; conclude it before the close is submitted.
    if let Some((timer, reader)) = canceled_read {
        rt.reactor().read_stop(stream);
        if let Some(t) = timer {
            rt.timers().disarm_and_release(t);
        }
        if let Some(reader) = reader {
            reader.resume(Resume::Int(i64::from(errno::ECANCELED)));
        }
    }

    {
        let mut s = sock.borrow_mut();
        s.current_coroutine = Some(co.clone());
        s.inflight = Some(OpKind::Close);
    }
    let on_close: CloseCallback = {
        let rt = Rc::clone(&rt);
        let sock = Rc::clone(sock);
        Box::new(move || socket_closed(&rt, &sock))
    };
    rt.reactor().close(stream, Some(on_close));
    Op::Yield
}

fn socket_closed(rt: &Rc<Runtime>, sock: &SocketRef) {
    let (timer, on_connect_anchor, coroutine_anchor, closer) = {
        let mut s = sock.borrow_mut();
        s.state = SocketState::Closed;
        let timer = s.pending_timer.take();
        let on_connect_anchor = s.on_connect_anchor.take();
        let coroutine_anchor = s.coroutine_anchor.take();
        s.owning_coroutine = None;
        let closer = s.conclude(OpKind::Close);
        (timer, on_connect_anchor, coroutine_anchor, closer)
    };
    if let Some(t) = timer {
        rt.timers().disarm_and_release(t);
    }
    drop(on_connect_anchor);
    drop(coroutine_anchor);
    if let Some(co) = closer {
        co.resume(Resume::Nil);
    }
}
