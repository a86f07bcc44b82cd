//! Operation dispatch.
//!
//! One entry per host-facing socket method. This layer owns argument
//! validation, address parsing, and the state guards; the launch logic and
//! completion handlers live in [`crate::socket`]. Programmer errors come
//! back as `Err(SocketError)`; everything else is a result tuple, either
//! produced synchronously (`Op::Complete`) or after a suspension
//! (`Op::Yield`, concluded by exactly one resume).

use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use crate::buffer::ReadBufferRef;
use crate::errno;
use crate::error::{Result, SocketError};
use crate::host::{CoroutineRef, HostValue, Resume};
use crate::runtime::Runtime;
use crate::socket::{self, SocketRef, SocketState, TcpSocket};

/// Outcome of a dispatcher call.
#[derive(Debug)]
pub enum Op {
    /// The result tuple is already available; the coroutine does not yield.
    Complete(Resume),
    /// The coroutine must suspend; a later resume delivers the result.
    Yield,
}

/// A `(family, host, port)` triple as returned by the address observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub family: u8,
    pub host: String,
    pub port: u16,
}

impl From<SocketAddr> for AddressRecord {
    fn from(addr: SocketAddr) -> Self {
        Self {
            family: if addr.is_ipv4() { 4 } else { 6 },
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Create a socket. With `anchor_coroutine` the calling coroutine is pinned
/// in the registry, which servers need so accept handlers can spawn from it
/// later. Fails with a status code when the reactor cannot register a
/// stream.
pub fn new_socket(
    rt: &Rc<Runtime>,
    co: &CoroutineRef,
    anchor_coroutine: bool,
) -> std::result::Result<SocketRef, i32> {
    TcpSocket::create(rt, co, anchor_coroutine)
}

/// Classify a string: `4` or `6` for an IP literal, `0` otherwise.
#[must_use]
pub fn is_ip(value: &str) -> u8 {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => 4,
        Ok(IpAddr::V6(_)) => 6,
        Err(_) => 0,
    }
}

fn parse_address(port: i64, host: &str) -> Result<SocketAddr> {
    if !(0..=65535).contains(&port) {
        return Err(SocketError::PortOutOfRange(port));
    }
    let ip: IpAddr = host
        .parse()
        .map_err(|_| SocketError::HostNotIp(host.to_string()))?;
    Ok(SocketAddr::new(ip, port as u16))
}

fn ensure_open(s: &TcpSocket) -> Result<()> {
    if s.state == SocketState::Closed {
        return Err(SocketError::Closed);
    }
    if s.closing {
        return Err(SocketError::AlreadyClosing);
    }
    Ok(())
}

/// `bind(port, host, reuse_port)`. Synchronous; returns the reactor's code.
pub fn bind(sock: &SocketRef, port: i64, host: &str, reuse_port: bool) -> Result<i32> {
    ensure_open(&sock.borrow())?;
    let addr = parse_address(port, host)?;
    let (rt, stream) = {
        let s = sock.borrow();
        (s.rt.clone(), s.stream)
    };
    let code = rt.reactor().tcp_bind(stream, addr, reuse_port);
    if code == 0 {
        let mut s = sock.borrow_mut();
        if s.state == SocketState::Uninit {
            s.state = SocketState::Bound;
        }
    }
    Ok(code)
}

/// `listen(on_connect, backlog)`. Anchors the callable on the socket and
/// arms the accept path. Synchronous.
pub fn listen(sock: &SocketRef, on_connect: HostValue, backlog: i64) -> Result<i32> {
    {
        let s = sock.borrow();
        ensure_open(&s)?;
        if s.state == SocketState::Listening {
            return Ok(errno::EINVAL);
        }
    }
    if !on_connect.is_callable() {
        return Err(SocketError::NotCallable);
    }
    if !(0..=i64::from(i32::MAX)).contains(&backlog) {
        return Ok(errno::EINVAL);
    }
    Ok(socket::start_listen(sock, on_connect, backlog as i32))
}

/// `connect(port, host)`. Suspends unless submission fails synchronously.
pub fn connect(sock: &SocketRef, co: &CoroutineRef, port: i64, host: &str) -> Result<Op> {
    ensure_open(&sock.borrow())?;
    let addr = parse_address(port, host)?;
    if sock.borrow().inflight.is_some() {
        return Ok(Op::Complete(Resume::Int(i64::from(errno::EBUSY))));
    }
    Ok(socket::start_connect(sock, co, addr))
}

/// `read()`. Requires a bound read buffer; suspends until data, end of
/// stream, an error, or the deadline.
pub fn read(sock: &SocketRef, co: &CoroutineRef) -> Result<Op> {
    {
        let s = sock.borrow();
        ensure_open(&s)?;
        let bound = s
            .read_buffer
            .as_ref()
            .and_then(std::rc::Weak::upgrade)
            .is_some();
        if !bound {
            return Err(SocketError::NoReadBuffer);
        }
        if s.inflight.is_some() {
            return Ok(Op::Complete(Resume::Int(i64::from(errno::EBUSY))));
        }
    }
    Ok(socket::start_read(sock, co))
}

/// `write(data)`. May complete synchronously when the non-blocking attempt
/// takes the whole payload; otherwise suspends.
pub fn write(sock: &SocketRef, co: &CoroutineRef, data: &HostValue) -> Result<Op> {
    ensure_open(&sock.borrow())?;
    let batch = crate::adapter::data_to_iovec(data)?;
    if sock.borrow().inflight.is_some() {
        return Ok(Op::Complete(Resume::Pair(0, i64::from(errno::EBUSY))));
    }
    Ok(socket::start_write(sock, Some(co), data, batch))
}

/// `write_async(data)`. Never suspends; the eventual completion only
/// releases resources.
pub fn write_async(sock: &SocketRef, data: &HostValue) -> Result<Op> {
    ensure_open(&sock.borrow())?;
    let batch = crate::adapter::data_to_iovec(data)?;
    Ok(socket::start_write(sock, None, data, batch))
}

/// `shutdown()`. Half-closes the write side; suspends.
pub fn shutdown(sock: &SocketRef, co: &CoroutineRef) -> Result<Op> {
    {
        let s = sock.borrow();
        ensure_open(&s)?;
        if s.inflight.is_some() {
            return Ok(Op::Complete(Resume::Int(i64::from(errno::EBUSY))));
        }
        if s.state != SocketState::Established {
            return Ok(Op::Complete(Resume::Int(i64::from(errno::ENOTCONN))));
        }
    }
    Ok(socket::start_shutdown(sock, co))
}

/// `close()`. Always suspends; the resume carries no values. Forbidden once
/// a close is already in flight.
pub fn close(sock: &SocketRef, co: &CoroutineRef) -> Result<Op> {
    {
        let s = sock.borrow();
        if s.state == SocketState::Closed {
            return Err(SocketError::Closed);
        }
        if s.closing {
            return Err(SocketError::AlreadyClosing);
        }
    }
    Ok(socket::start_close(sock, co))
}

/// `fd()`. The underlying descriptor.
pub fn fd(sock: &SocketRef) -> Result<i32> {
    let s = sock.borrow();
    ensure_open(&s)?;
    Ok(s.rt.reactor().fd(s.stream))
}

/// `set_read_buffer(buffer)`. The socket keeps only a weak link; the buffer
/// stays host-owned.
pub fn set_read_buffer(sock: &SocketRef, buffer: &ReadBufferRef) -> Result<()> {
    let mut s = sock.borrow_mut();
    ensure_open(&s)?;
    s.read_buffer = Some(Rc::downgrade(buffer));
    Ok(())
}

/// `set_timeout(ms)`. Default deadline for subsequent operations; 0 turns
/// deadlines off.
pub fn set_timeout(sock: &SocketRef, timeout_ms: i64) -> Result<()> {
    if timeout_ms < 0 {
        return Err(SocketError::NegativeTimeout(timeout_ms));
    }
    let mut s = sock.borrow_mut();
    ensure_open(&s)?;
    s.timeout_ms = timeout_ms as u64;
    Ok(())
}

/// `set_nodelay(enable)`.
pub fn set_nodelay(sock: &SocketRef, enable: bool) -> Result<i32> {
    let s = sock.borrow();
    ensure_open(&s)?;
    Ok(s.rt.reactor().tcp_nodelay(s.stream, enable))
}

/// `set_keepalive(enable, delay)`. `delay` (seconds) is required and
/// non-negative when enabling.
pub fn set_keepalive(sock: &SocketRef, enable: bool, delay: Option<i64>) -> Result<i32> {
    let delay_secs = if enable {
        match delay {
            Some(d) if d >= 0 => d.min(i64::from(u32::MAX)) as u32,
            _ => return Err(SocketError::KeepaliveDelay),
        }
    } else {
        0
    };
    let s = sock.borrow();
    ensure_open(&s)?;
    Ok(s.rt.reactor().tcp_keepalive(s.stream, enable, delay_secs))
}

/// `local_address()`.
pub fn local_address(sock: &SocketRef) -> Result<(Option<AddressRecord>, i32)> {
    let s = sock.borrow();
    ensure_open(&s)?;
    Ok(match s.rt.reactor().getsockname(s.stream) {
        Ok(addr) => (Some(addr.into()), 0),
        Err(code) => (None, code),
    })
}

/// `remote_address()`.
pub fn remote_address(sock: &SocketRef) -> Result<(Option<AddressRecord>, i32)> {
    let s = sock.borrow();
    ensure_open(&s)?;
    Ok(match s.rt.reactor().getpeername(s.stream) {
        Ok(addr) => (Some(addr.into()), 0),
        Err(code) => (None, code),
    })
}
