//! The four best-effort socket options this crate recognizes.

use std::io;

use socket2::Socket;

use crate::error::{SokError, SokResult};

/// A socket option request. Applying one is best-effort: a platform that
/// rejects the underlying `setsockopt` call surfaces `OptionNotSupported`
/// rather than a raw OS error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Hint for the OS receive buffer size, in bytes.
    RecvBufferSize(usize),
    /// Hint for the OS send buffer size, in bytes.
    SendBufferSize(usize),
    /// `SO_KEEPALIVE`.
    KeepAlive(bool),
    /// `TCP_NODELAY`.
    NoDelay(bool),
}

impl SocketOption {
    pub(crate) fn apply(self, socket: &Socket) -> SokResult<()> {
        let result = match self {
            SocketOption::RecvBufferSize(n) => socket.set_recv_buffer_size(n),
            SocketOption::SendBufferSize(n) => socket.set_send_buffer_size(n),
            SocketOption::KeepAlive(enabled) => socket.set_keepalive(enabled),
            SocketOption::NoDelay(enabled) => socket.set_nodelay(enabled),
        };
        result.map_err(map_setsockopt_error)
    }
}

fn map_setsockopt_error(err: io::Error) -> SokError {
    match err.raw_os_error() {
        Some(libc::ENOPROTOOPT) | Some(libc::EOPNOTSUPP) => SokError::OptionNotSupported,
        _ => SokError::Io(err),
    }
}
