//! Event reactor interface.
//!
//! The reactor owns the OS sockets and one-shot timers and delivers
//! completions as callbacks on the single reactor thread. Streams and timers
//! are addressed by opaque ids so callbacks never hold references into the
//! reactor's own tables.
//!
//! Contract every implementation upholds:
//! - status results are `0` or a negative errno-style code from
//!   [`crate::errno`];
//! - connect/write/shutdown completion callbacks run **exactly once**, and
//!   never during the submitting call;
//! - closing a stream first delivers `ECANCELED` to completions still
//!   pending on it, then runs the close callback (request lifetimes in the
//!   socket core depend on this order);
//! - the buffer-request callback of a read may return `None` to decline; the
//!   reactor then skips that read without reporting anything.

pub mod poll;
pub mod sim;

use std::io::IoSlice;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

use crate::buffer::ReadBufferRef;

/// Identifies a stream registered with the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) usize);

/// Identifies a one-shot timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

/// Completion of a connect, write, or shutdown.
pub type StatusCallback = Box<dyn FnOnce(i32)>;
/// Incoming-connection notification on a listener; fired per connection.
pub type ConnectionCallback = Box<dyn FnMut(i32)>;
/// Buffer request before each kernel read. Receives a suggested byte count.
pub type AllocCallback = Box<dyn FnMut(usize) -> Option<ReadBufferRef>>;
/// Read result: bytes read, `0` for "nothing this round", or a negative code
/// (`EOF` included).
pub type ReadCallback = Box<dyn FnMut(isize)>;
/// One-shot timer expiry.
pub type TimerCallback = Box<dyn FnOnce()>;
/// Close completion.
pub type CloseCallback = Box<dyn FnOnce()>;

/// Shared reactor handle.
pub type ReactorRef = Rc<dyn Reactor>;

pub trait Reactor {
    /// Register a new, unconnected stream slot.
    fn stream_init(&self) -> Result<StreamId, i32>;

    /// Bind to a local address. `reuse_port` requests `SO_REUSEPORT`.
    fn tcp_bind(&self, s: StreamId, addr: SocketAddr, reuse_port: bool) -> i32;

    /// Start accepting connections; `on_connection` fires once per incoming
    /// connection (or with a negative status on accept failure).
    fn listen(&self, s: StreamId, backlog: i32, on_connection: ConnectionCallback) -> i32;

    /// Move the next pending connection of `server` into the `child` slot.
    fn accept(&self, server: StreamId, child: StreamId) -> i32;

    /// Begin connecting; `on_complete` receives the final status.
    fn connect(&self, s: StreamId, addr: SocketAddr, on_complete: StatusCallback) -> i32;

    /// Start the read loop: `on_alloc` supplies the fill buffer before each
    /// kernel read, `on_read` receives each result.
    fn read_start(&self, s: StreamId, on_alloc: AllocCallback, on_read: ReadCallback) -> i32;

    /// Stop the read loop. No `on_read` runs after this returns.
    fn read_stop(&self, s: StreamId) -> i32;

    /// Non-blocking scatter write attempt. Returns accepted bytes, or
    /// `EAGAIN`/`ENOSYS` when nothing could be taken, or another negative
    /// code on failure.
    fn try_write(&self, s: StreamId, bufs: &[IoSlice<'_>]) -> isize;

    /// Queue an asynchronous write of `bufs`; `on_complete` fires once the
    /// kernel has taken all of it (or with the failure status).
    fn write2(&self, s: StreamId, bufs: Vec<Bytes>, on_complete: StatusCallback) -> i32;

    /// Shut down the write half once queued writes have drained.
    fn shutdown(&self, s: StreamId, on_complete: StatusCallback) -> i32;

    /// Close the stream. Pending completions get `ECANCELED` first; then
    /// `on_close` runs.
    fn close(&self, s: StreamId, on_close: Option<CloseCallback>);

    /// Whether `close` has been requested or completed.
    fn is_closing(&self, s: StreamId) -> bool;

    fn tcp_nodelay(&self, s: StreamId, enable: bool) -> i32;

    /// `delay_secs` is the keepalive idle time; ignored when disabling.
    fn tcp_keepalive(&self, s: StreamId, enable: bool, delay_secs: u32) -> i32;

    fn getsockname(&self, s: StreamId) -> Result<SocketAddr, i32>;

    fn getpeername(&self, s: StreamId) -> Result<SocketAddr, i32>;

    /// Underlying descriptor, or a negative code.
    fn fd(&self, s: StreamId) -> i32;

    /// Obtain a timer slot.
    fn timer_init(&self) -> Result<TimerId, i32>;

    /// Arm a one-shot timer. No repeat.
    fn timer_start(&self, t: TimerId, timeout_ms: u64, on_fire: TimerCallback) -> i32;

    /// Disarm; the callback will not run after this returns. Harmless on a
    /// timer that already fired.
    fn timer_stop(&self, t: TimerId) -> i32;

    /// Return the slot. The id is dead afterwards.
    fn timer_release(&self, t: TimerId);
}
