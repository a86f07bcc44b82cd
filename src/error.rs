/// Socket programmer errors.
///
/// These are contract violations by the host script, not recoverable I/O
/// conditions: they are raised to the host as errors instead of being
/// returned as a status code in a result tuple.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Port argument outside `[0, 65535]`.
    #[error("port must be in [0, 65535], got {0}")]
    PortOutOfRange(i64),

    /// Host argument is not an IPv4/IPv6 literal (hostnames are rejected).
    #[error("host is not an IP address: {0:?}")]
    HostNotIp(String),

    /// Negative timeout handed to `set_timeout`.
    #[error("timeout must be >= 0, got {0}")]
    NegativeTimeout(i64),

    /// Keepalive was enabled without a delay, or with a negative delay.
    #[error("keepalive delay must be present and >= 0 when keepalive is enabled")]
    KeepaliveDelay,

    /// `read` was called before `set_read_buffer`, or the buffer was dropped.
    #[error("no read buffer, please set a read buffer")]
    NoReadBuffer,

    /// The on-connect argument of `listen` is not callable.
    #[error("onconnect must be callable")]
    NotCallable,

    /// The data argument of `write`/`write_async` has an unsupported shape.
    #[error("write data must be bytes, a sequence of bytes, or a read buffer")]
    BadWriteData,

    /// An operation was issued on a socket that is already closing.
    #[error("socket is already closing")]
    AlreadyClosing,

    /// An operation was issued on a socket whose close has completed.
    #[error("socket is closed")]
    Closed,
}

impl SocketError {
    /// True when the error reports a bad argument rather than bad socket
    /// state; hosts typically map these to their argument-error surface.
    #[must_use]
    pub const fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::PortOutOfRange(_)
                | Self::HostNotIp(_)
                | Self::NegativeTimeout(_)
                | Self::KeepaliveDelay
                | Self::NotCallable
                | Self::BadWriteData
        )
    }
}

/// Result type alias for dispatcher entry points.
pub type Result<T> = std::result::Result<T, SocketError>;
