//! Strandio
//!
//! Coroutine-oriented TCP socket core for embeddable scripting runtimes.
//! Host coroutines call synchronous-looking socket operations; each
//! suspending operation registers with an event reactor and is resumed by
//! exactly one of completion or deadline expiry.
//!
//! Building blocks:
//! - Reactor interface + poller-backed and simulated implementations
//!   (`reactor`)
//! - Byte pool with size-class rounding (`pool`)
//! - Request arena for cross-callback operation state (`arena`)
//! - One-shot deadline ownership (`timer`)
//! - Host-owned read buffers (`buffer`)
//! - Host-value anchoring (`registry`)
//! - Socket objects + completion handlers (`socket`)
//! - Operation dispatch and validation (`ops`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod adapter;
pub mod arena;
pub mod buffer;
pub mod config;
pub mod errno;
pub mod error;
pub mod host;
pub mod ops;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod runtime;
pub mod socket;
pub mod timer;

// Optional: a small prelude to make embedders ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::buffer::{ReadBuffer, ReadBufferRef};
    pub use crate::config::RuntimeOptions;
    pub use crate::error::SocketError;
    pub use crate::host::{Coroutine, CoroutineRef, HostFn, HostValue, Resume, Scheduler};
    pub use crate::ops::{self, AddressRecord, Op};
    pub use crate::reactor::{Reactor, ReactorRef};
    pub use crate::runtime::Runtime;
    pub use crate::socket::{Role, SocketRef, SocketState};
}
