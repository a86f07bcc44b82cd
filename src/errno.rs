//! Status codes shared with the reactor.
//!
//! Every asynchronous primitive reports completion as `0` or a negative
//! errno-style integer, and the socket core surfaces those integers to the
//! host unchanged. The constants below mirror the Linux errno values the
//! reactor negates; `EOF` sits outside the errno range so stream end can be
//! told apart from a transport error.

use std::io;

pub const EIO: i32 = -5;
pub const EAGAIN: i32 = -11;
pub const ENOMEM: i32 = -12;
pub const EBUSY: i32 = -16;
pub const EINVAL: i32 = -22;
pub const EPIPE: i32 = -32;
pub const ENOSYS: i32 = -38;
pub const EADDRINUSE: i32 = -98;
pub const EADDRNOTAVAIL: i32 = -99;
pub const ENOBUFS: i32 = -105;
pub const ECONNRESET: i32 = -104;
pub const ENOTCONN: i32 = -107;
pub const ETIMEDOUT: i32 = -110;
pub const ECONNREFUSED: i32 = -111;
pub const ECANCELED: i32 = -125;

/// End of stream. Reported by a read when the peer has closed its write half
/// and all buffered data has been delivered.
pub const EOF: i32 = -4095;

/// Human-readable name for a status code, for log lines and error strings.
pub fn describe(code: i32) -> &'static str {
    match code {
        0 => "ok",
        EIO => "i/o error",
        EAGAIN => "resource temporarily unavailable",
        ENOMEM => "not enough memory",
        EBUSY => "resource busy",
        EINVAL => "invalid argument",
        EPIPE => "broken pipe",
        ENOSYS => "function not supported",
        EADDRINUSE => "address already in use",
        EADDRNOTAVAIL => "address not available",
        ENOBUFS => "no buffer space available",
        ECONNRESET => "connection reset by peer",
        ENOTCONN => "socket is not connected",
        ETIMEDOUT => "operation timed out",
        ECONNREFUSED => "connection refused",
        ECANCELED => "operation canceled",
        EOF => "end of stream",
        _ => "unknown error",
    }
}

/// Map an [`io::Error`] into the negative status space.
pub fn from_io(err: &io::Error) -> i32 {
    if let Some(raw) = err.raw_os_error() {
        return -raw;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => EAGAIN,
        io::ErrorKind::TimedOut => ETIMEDOUT,
        io::ErrorKind::ConnectionRefused => ECONNREFUSED,
        io::ErrorKind::ConnectionReset => ECONNRESET,
        io::ErrorKind::NotConnected => ENOTCONN,
        io::ErrorKind::AddrInUse => EADDRINUSE,
        io::ErrorKind::AddrNotAvailable => EADDRNOTAVAIL,
        io::ErrorKind::BrokenPipe => EPIPE,
        io::ErrorKind::InvalidInput => EINVAL,
        io::ErrorKind::UnexpectedEof => EOF,
        io::ErrorKind::OutOfMemory => ENOMEM,
        _ => EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_known_codes() {
        assert_eq!(describe(0), "ok");
        assert_eq!(describe(ETIMEDOUT), "operation timed out");
        assert_eq!(describe(EOF), "end of stream");
        assert_eq!(describe(-12345), "unknown error");
    }

    #[test]
    fn io_error_mapping_prefers_raw_os_error() {
        let err = io::Error::from_raw_os_error(110);
        assert_eq!(from_io(&err), ETIMEDOUT);

        let err = io::Error::new(io::ErrorKind::WouldBlock, "try again");
        assert_eq!(from_io(&err), EAGAIN);
    }
}
