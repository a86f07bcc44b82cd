//! Host-side execution model.
//!
//! The scripting VM owns the coroutines; the socket core only needs two
//! capabilities from it: resuming a suspended coroutine with a small result
//! tuple, and minting a fresh coroutine for an accepted connection. Both are
//! expressed as object-safe traits so the core never links against a
//! particular VM.

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use crate::buffer::ReadBufferRef;
use crate::socket::SocketRef;

/// A suspended host execution context.
///
/// `resume` hands the values a synchronous-looking socket call "returns" back
/// to the script. The core guarantees exactly one resume per suspension.
pub trait Coroutine {
    fn resume(&self, value: Resume);
}

/// Shared handle to a host coroutine.
pub type CoroutineRef = Rc<dyn Coroutine>;

/// Mints coroutines on behalf of the accept path.
///
/// `spawn` creates a child context from the listening socket's owning
/// coroutine; `entry` is the anchored on-connect value the child should run.
/// The child's first resume carries the accepted socket.
pub trait Scheduler {
    fn spawn(&self, parent: &CoroutineRef, entry: &HostValue) -> CoroutineRef;
}

/// A host function value: the body a spawned coroutine executes.
///
/// Invoked by the host with the coroutine's own handle and each resume value
/// in turn; per-connection state lives in the closure.
pub type HostFn = Rc<dyn Fn(&CoroutineRef, Resume)>;

/// The host values the socket core handles or keeps alive.
#[derive(Clone)]
pub enum HostValue {
    /// A byte string.
    Bytes(Bytes),
    /// A sequence of byte strings (scatter/gather payload).
    Chunks(Vec<Bytes>),
    /// A read buffer object; the readable region is the payload.
    Buffer(ReadBufferRef),
    /// A callable (accept handlers).
    Callable(HostFn),
    /// A coroutine handle (listener ownership).
    Coroutine(CoroutineRef),
}

impl HostValue {
    #[must_use]
    pub const fn is_callable(&self) -> bool {
        matches!(self, Self::Callable(_))
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Chunks(c) => f.debug_tuple("Chunks").field(&c.len()).finish(),
            Self::Buffer(_) => f.write_str("Buffer"),
            Self::Callable(_) => f.write_str("Callable"),
            Self::Coroutine(_) => f.write_str("Coroutine"),
        }
    }
}

/// The value tuple a resume delivers to the script.
#[derive(Clone)]
pub enum Resume {
    /// No values (`close`).
    Nil,
    /// A single integer: a status code, or a read's byte count.
    Int(i64),
    /// `(bytes, status)` as produced by the write family.
    Pair(i64, i64),
    /// A freshly accepted socket, delivered to a spawned coroutine.
    Socket(SocketRef),
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Self::Pair(a, b) => f.debug_tuple("Pair").field(a).field(b).finish(),
            Self::Socket(_) => f.write_str("Socket(..)"),
        }
    }
}

impl PartialEq for Resume {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Pair(a, b), Self::Pair(c, d)) => a == c && b == d,
            (Self::Socket(a), Self::Socket(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}
