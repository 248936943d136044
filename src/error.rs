//! The error taxonomy shared by every layer of `sok`.

use std::io;

/// Common result alias used throughout the crate.
pub type SokResult<T> = Result<T, SokError>;

/// All named failure variants a caller of `sok` can observe.
///
/// Recoverable OS conditions (`WouldBlock`, `EINTR`) never surface here: the
/// selector and the socket I/O loops handle those internally by re-arming
/// interest. What's left are the terminal and misuse conditions a caller can
/// actually observe.
#[derive(Debug, thiserror::Error)]
pub enum SokError {
    /// Terminal, benign: produced by a graceful `close()`.
    #[error("socket closed normally")]
    NormalClose,

    /// Terminal: produced by `force_close()`, dropping queued writes.
    #[error("socket force-closed")]
    ForceClose,

    /// Terminal: the peer shut down the connection.
    #[error("peer closed the connection")]
    PeerClose,

    /// An I/O method was called on a socket that already reached a terminal
    /// state.
    #[error("socket already closed")]
    SocketClosed,

    /// `connect` failed with `ECONNREFUSED` (or the platform's RST
    /// equivalent).
    #[error("connection refused")]
    ConnectionRefused,

    /// Bind failed because the address/port was already in use.
    #[error("address already in use")]
    AddressInUse,

    /// A second read was attempted while one was already in progress on the
    /// same socket.
    #[error("a read is already in progress on this socket")]
    ConcurrentReading,

    /// A requested socket option is not available on this platform.
    #[error("socket option not supported on this platform")]
    OptionNotSupported,

    /// A `get`/`put` would read or write past the buffer's `limit`.
    #[error("buffer overflow: requested {requested} bytes, {remaining} remaining")]
    BufferOverflow { requested: usize, remaining: usize },

    /// A `get` would read past the buffer's `limit` on a relative op, or an
    /// absolute index fell outside `[0, limit)`.
    #[error("buffer underflow: requested {requested} bytes, {remaining} remaining")]
    BufferUnderflow { requested: usize, remaining: usize },

    /// An operation was attempted on a `Buffer` after `destroy()`.
    #[error("buffer has been destroyed")]
    BufferDestroyed,

    /// The registration or the selector it belonged to was closed while a
    /// `select`/`select_always` call was pending, and no more specific cause
    /// applies.
    #[error("operation cancelled")]
    Cancelled,

    /// Any OS-level failure that doesn't map to one of the named variants
    /// above: an escape hatch for "everything else".
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SokError {
    /// Maps a raw `errno` observed after a non-blocking `connect` became
    /// writable into the appropriate taxonomy member.
    pub(crate) fn from_connect_errno(errno: i32) -> SokError {
        match errno {
            libc::ECONNREFUSED => SokError::ConnectionRefused,
            0 => unreachable!("from_connect_errno called with a successful connect"),
            _ => SokError::Io(io::Error::from_raw_os_error(errno)),
        }
    }

    /// Maps the `POLLERR`/`POLLHUP` bits the selector observes on a ready
    /// descriptor into a close cause, consulting `SO_ERROR` when available.
    /// `POLLRDHUP` is deliberately not treated as a hangup here: it fires
    /// alongside `POLLIN` on a half-closed peer while there may still be
    /// buffered bytes to read, so it's left to flow to the normal readable
    /// dispatch path and surface as a 0-byte `recv` once the peer's data is
    /// actually drained.
    pub(crate) fn from_hangup(pending_error: Option<i32>) -> SokError {
        match pending_error {
            Some(0) | None => SokError::PeerClose,
            Some(libc::ECONNRESET) => SokError::Io(io::Error::from_raw_os_error(libc::ECONNRESET)),
            Some(errno) => SokError::Io(io::Error::from_raw_os_error(errno)),
        }
    }

    /// True for the three terminal-but-benign-or-requested variants that a
    /// close-handler fires for regardless of which side initiated the close.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SokError::NormalClose | SokError::ForceClose | SokError::PeerClose
        )
    }
}

impl Clone for SokError {
    /// `Registration` waiters need to fan the same cause out to every
    /// pending direction; `io::Error` doesn't implement `Clone`, so it's
    /// re-derived from its `raw_os_error`/`kind` instead.
    fn clone(&self) -> Self {
        match self {
            SokError::NormalClose => SokError::NormalClose,
            SokError::ForceClose => SokError::ForceClose,
            SokError::PeerClose => SokError::PeerClose,
            SokError::SocketClosed => SokError::SocketClosed,
            SokError::ConnectionRefused => SokError::ConnectionRefused,
            SokError::AddressInUse => SokError::AddressInUse,
            SokError::ConcurrentReading => SokError::ConcurrentReading,
            SokError::OptionNotSupported => SokError::OptionNotSupported,
            SokError::BufferOverflow { requested, remaining } => SokError::BufferOverflow {
                requested: *requested,
                remaining: *remaining,
            },
            SokError::BufferUnderflow { requested, remaining } => SokError::BufferUnderflow {
                requested: *requested,
                remaining: *remaining,
            },
            SokError::BufferDestroyed => SokError::BufferDestroyed,
            SokError::Cancelled => SokError::Cancelled,
            SokError::Io(err) => match err.raw_os_error() {
                Some(errno) => SokError::Io(io::Error::from_raw_os_error(errno)),
                None => SokError::Io(io::Error::new(err.kind(), err.to_string())),
            },
        }
    }
}
