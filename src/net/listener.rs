//! Non-blocking TCP listening socket.
//!
//! Mirrors `tokio-rs-mio`'s `net::tcp::TcpListener::bind`/`accept`
//! (`src/net/tcp/listener.rs`): family-agnostic address resolution,
//! `SO_REUSEADDR`, `IPV6_V6ONLY=0` for dual-stack binds, and a generous
//! listen backlog.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::{SokError, SokResult};
use crate::executor::{Promise, Runtime};
use crate::interest::Direction;
use crate::net::stream::TcpStream;
use crate::options::SocketOption;
use crate::selector::registration::Registration;

const LISTEN_BACKLOG_SIZE: i32 = 1024;

struct ListenerInner {
    socket: Socket,
    registration: Registration,
    runtime: Runtime,
    closed: Cell<bool>,
    exception_handler: RefCell<Option<Box<dyn Fn(SokError)>>>,
}

/// A listening TCP endpoint. The sockets it produces via [`TcpListener::accept`]
/// have an identical contract to one created by `create_tcp_client_socket`.
#[derive(Clone)]
pub struct TcpListener {
    inner: Rc<ListenerInner>,
}

impl TcpListener {
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// The address this listener is actually bound to — useful when
    /// binding to port 0 and letting the OS assign one.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "bound address is not an IP socket address")
        })
    }

    pub fn bind_exception_handler<F>(&self, handler: F)
    where
        F: Fn(SokError) + 'static,
    {
        *self.inner.exception_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_option(&self, option: SocketOption) -> SokResult<()> {
        option.apply(&self.inner.socket)
    }

    /// Suspends on readable readiness until a connection is pending, then
    /// `accept`s it, makes the new descriptor non-blocking, and registers
    /// it with the same selector.
    pub async fn accept(&self) -> SokResult<TcpStream> {
        loop {
            if self.inner.closed.get() {
                return Err(SokError::SocketClosed);
            }
            match self.inner.socket.accept() {
                Ok((accepted, addr)) => {
                    accepted.set_nonblocking(true)?;
                    let fd = accepted.as_raw_fd();
                    let registration = self.inner.runtime.selector().register(fd);
                    let peer = addr
                        .as_socket()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    return Ok(TcpStream::from_parts(
                        self.inner.runtime.clone(),
                        accepted,
                        registration,
                        peer,
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inner.registration.select(Direction::Readable).await?;
                }
                Err(e) => return Err(SokError::Io(e)),
            }
        }
    }

    /// Non-suspending variant of [`TcpListener::accept`].
    pub fn accept_async(&self) -> Promise<SokResult<TcpStream>> {
        let (setter, promise) = Promise::new_pair();
        let listener = self.clone();
        self.inner.runtime.spawn(async move {
            let result = listener.accept().await;
            setter.fulfill(result);
        });
        promise
    }

    /// Deregisters and closes the listening fd; any `accept` suspended on
    /// it resumes with `NormalClose`.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        self.inner.registration.close(Some(SokError::NormalClose));
    }
}

/// Resolves `address:port` (family-agnostic), binds with `SO_REUSEADDR` and
/// dual-stack `IPV6_V6ONLY=0`, and starts listening.
pub async fn create_tcp_server_socket(
    runtime: &Runtime,
    address: &str,
    port: u16,
) -> SokResult<TcpListener> {
    let addr = (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| SokError::Io(io::Error::new(io::ErrorKind::InvalidInput, "no addresses resolved")))?;

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if domain == Domain::IPV6 {
        let _ = socket.set_only_v6(false);
    }
    socket.set_reuse_address(true)?;

    socket.bind(&SockAddr::from(addr)).map_err(|e| {
        if e.raw_os_error() == Some(libc::EADDRINUSE) {
            SokError::AddressInUse
        } else {
            SokError::Io(e)
        }
    })?;
    socket.listen(LISTEN_BACKLOG_SIZE)?;

    let fd = socket.as_raw_fd();
    let registration = runtime.selector().register(fd);

    Ok(TcpListener {
        inner: Rc::new(ListenerInner {
            socket,
            registration,
            runtime: runtime.clone(),
            closed: Cell::new(false),
            exception_handler: RefCell::new(None),
        }),
    })
}
