//! `sok`: suspension-based TCP client/server sockets over a single-threaded
//! `poll(2)` readiness selector.
//!
//! The pieces, leaves first:
//! - [`Buffer`] — a cursor/limit byte region all reads and writes borrow.
//! - [`selector`] — the readiness loop and its [`Registration`] handles.
//! - [`executor`] — the single-threaded [`Runtime`] that drives suspending
//!   calls to completion.
//! - [`net`] — [`TcpStream`]/[`TcpListener`], built on top of the above.
//!
//! Everything that suspends (`Registration::select`, `TcpStream::read`,
//! `TcpStream::write`, `TcpStream::close`, `TcpListener::accept`) is an
//! `async fn` and must run inside a [`Runtime`]:
//!
//! ```no_run
//! use sok::{alloc_buffer, create_tcp_client_socket, Runtime};
//!
//! let runtime = Runtime::new().unwrap();
//! let rt = runtime.clone();
//! runtime.block_on(async move {
//!     let stream = create_tcp_client_socket(&rt, "127.0.0.1", 9000).await.unwrap();
//!     let mut buf = alloc_buffer(1024);
//!     let n = stream.read(&mut buf).await.unwrap();
//!     println!("read {} bytes", n);
//! });
//! ```

pub mod buf;
pub mod error;
pub mod executor;
pub mod interest;
pub mod net;
pub mod options;
pub mod selector;

pub use buf::Buffer;
pub use error::{SokError, SokResult};
pub use executor::{Promise, Runtime};
pub use interest::{Direction, Interest};
pub use net::{create_tcp_client_socket, create_tcp_server_socket, TcpListener, TcpStream};
pub use options::SocketOption;
pub use selector::registration::Registration;
pub use selector::Selector;

/// Allocates a zero-filled [`Buffer`] of the given capacity.
pub fn alloc_buffer(capacity: usize) -> Buffer {
    Buffer::alloc(capacity)
}

/// Wraps an existing byte vector in a [`Buffer`].
pub fn wrap_buffer(bytes: Vec<u8>) -> Buffer {
    Buffer::wrap(bytes)
}
