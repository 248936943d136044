//! Non-blocking TCP client socket.
//!
//! Construction is grounded on `tokio-rs-mio`'s `net::tcp::TcpStream::connect`
//! (`src/net/tcp/stream.rs`): a `socket2::Socket` created non-blocking,
//! `connect()` issued and `EINPROGRESS`/`WouldBlock` tolerated, then the
//! first writable readiness inspects `SO_ERROR`. Reads/writes use raw
//! `libc::recv`/`libc::send` on the registered fd rather than routing
//! through `socket2`'s `MaybeUninit`-based `recv`, since the selector
//! already owns the fd's readiness bookkeeping and the buffer's
//! cursor/limit window is exactly the slice these syscalls need.
//!
//! Writes funnel through a dedicated per-socket writer task owning a FIFO
//! queue, preferred over a mutex because it gives natural submission
//! ordering and a single place to observe "queue drained" for graceful
//! close.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::buf::Buffer;
use crate::error::{SokError, SokResult};
use crate::executor::{Promise, Runtime};
use crate::interest::Direction;
use crate::options::SocketOption;
use crate::selector::{self, registration::Registration};

fn raw_recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

struct WriteCompletion {
    waker: Option<std::task::Waker>,
    result: Option<SokResult<()>>,
}

enum WriteQueueItem {
    Data {
        buffer: Buffer,
        completion: Rc<RefCell<WriteCompletion>>,
    },
    CloseAfterDrain,
}

struct StreamInner {
    socket: Socket,
    registration: Registration,
    runtime: Runtime,
    peer_addr: String,
    reading: Cell<bool>,
    closed: Cell<bool>,
    close_after_drain: Cell<bool>,
    close_handler: RefCell<Option<Box<dyn FnOnce(SokError)>>>,
    close_handler_fired: Cell<bool>,
    exception_handler: RefCell<Option<Box<dyn Fn(SokError)>>>,
    write_queue: RefCell<VecDeque<WriteQueueItem>>,
    write_waker: RefCell<Option<std::task::Waker>>,
}

impl StreamInner {
    /// Dedupes the first terminal cause: closes the registration (idempotent
    /// on its own), then fires the exception handler and the close handler
    /// exactly once each, regardless of which internal task observed it
    /// first.
    fn terminate(&self, cause: SokError) {
        if self.closed.replace(true) {
            return;
        }
        self.registration.close(Some(cause.clone()));
        if let Some(handler) = self.exception_handler.borrow().as_ref() {
            handler(cause.clone());
        }
        self.fire_close_handler(cause);
    }

    fn fire_close_handler(&self, cause: SokError) {
        if self.close_handler_fired.replace(true) {
            return;
        }
        if let Some(handler) = self.close_handler.borrow_mut().take() {
            handler(cause);
        }
    }

    fn wake_writer(&self) {
        if let Some(waker) = self.write_waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// A non-blocking TCP stream endpoint, used both for outbound connections
/// (`create_tcp_client_socket`) and accepted connections
/// (`TcpListener::accept`) — the contract is identical for both.
#[derive(Clone)]
pub struct TcpStream {
    inner: Rc<StreamInner>,
}

impl TcpStream {
    pub(crate) fn from_parts(
        runtime: Runtime,
        socket: Socket,
        registration: Registration,
        peer_addr: String,
    ) -> TcpStream {
        let inner = Rc::new(StreamInner {
            socket,
            registration,
            runtime: runtime.clone(),
            peer_addr,
            reading: Cell::new(false),
            closed: Cell::new(false),
            close_after_drain: Cell::new(false),
            close_handler: RefCell::new(None),
            close_handler_fired: Cell::new(false),
            exception_handler: RefCell::new(None),
            write_queue: RefCell::new(VecDeque::new()),
            write_waker: RefCell::new(None),
        });
        runtime.spawn(writer_loop(inner.clone()));
        TcpStream { inner }
    }

    pub fn peer_address(&self) -> &str {
        &self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Installs the handler invoked exactly once, on whichever terminal
    /// transition happens first.
    pub fn bind_close_handler<F>(&self, handler: F)
    where
        F: FnOnce(SokError) + 'static,
    {
        *self.inner.close_handler.borrow_mut() = Some(Box::new(handler));
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

    fn begin_read(&self) -> SokResult<()> {
        if self.inner.closed.get() {
            return Err(SokError::SocketClosed);
        }
        if self.inner.reading.replace(true) {
            return Err(SokError::ConcurrentReading);
        }
        Ok(())
    }

    /// One syscall's worth of data, retrying on would-block by suspending
    /// on readable readiness. Returns `Ok(0)` without a syscall if `buf` has
    /// no remaining space.
    async fn read_once(&self, buf: &mut Buffer) -> SokResult<usize> {
        if buf.remaining() == 0 {
            return Ok(0);
        }
        loop {
            let fd = self.inner.registration.fd();
            match raw_recv(fd, buf.active_mut()) {
                Ok(0) => {
                    self.inner.terminate(SokError::PeerClose);
                    return Err(SokError::PeerClose);
                }
                Ok(n) => {
                    buf.advance_cursor(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inner.registration.select(Direction::Readable).await?;
                }
                Err(e) => {
                    let cause = SokError::Io(e);
                    self.inner.terminate(cause.clone());
                    return Err(cause);
                }
            }
        }
    }

    /// `read(buf)`: at most one syscall's worth of bytes.
    pub async fn read(&self, buf: &mut Buffer) -> SokResult<usize> {
        self.begin_read()?;
        let result = self.read_once(buf).await;
        self.inner.reading.set(false);
        result
    }

    /// `read(buf, minToRead)`: loops `read_once` until at least
    /// `min_to_read` bytes have landed since the call started.
    pub async fn read_min(&self, buf: &mut Buffer, min_to_read: usize) -> SokResult<usize> {
        if min_to_read > buf.remaining() {
            return Err(SokError::BufferOverflow {
                requested: min_to_read,
                remaining: buf.remaining(),
            });
        }
        self.begin_read()?;
        let start = buf.get_cursor();
        let mut result = Ok(());
        while buf.get_cursor() - start < min_to_read {
            if let Err(e) = self.read_once(buf).await {
                result = Err(e);
                break;
            }
        }
        self.inner.reading.set(false);
        result.map(|()| buf.get_cursor() - start)
    }

    /// `bulkRead(buf, cb)`: a `select_always` loop that performs the syscall
    /// and invokes `cb` inline with selector dispatch, avoiding
    /// per-iteration task-resumption cost. Ownership of `buf`
    /// passes in and is handed back alongside the result, since the
    /// continuous callback registered with the selector must be `'static`
    /// and so cannot borrow the caller's buffer.
    pub async fn bulk_read<F>(&self, buf: Buffer, mut cb: F) -> (Buffer, SokResult<()>)
    where
        F: FnMut(&mut Buffer) -> bool + 'static,
    {
        if let Err(e) = self.begin_read() {
            return (buf, Err(e));
        }

        let shared = Rc::new(RefCell::new(buf));
        let shared_for_cb = shared.clone();
        let inner = self.inner.clone();

        let result = self
            .inner
            .registration
            .select_always(Direction::Readable, move || {
                let mut b = shared_for_cb.borrow_mut();
                if b.set_cursor(0).is_err() {
                    return false;
                }
                let fd = inner.registration.fd();
                match raw_recv(fd, b.active_mut()) {
                    Ok(0) => {
                        inner.terminate(SokError::PeerClose);
                        false
                    }
                    Ok(n) => {
                        b.advance_cursor(n);
                        // bulkRead's own predicate returns true to stop;
                        // selectAlways returns true to keep going.
                        !cb(&mut b)
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                    Err(e) => {
                        inner.terminate(SokError::Io(e));
                        false
                    }
                }
            })
            .await;

        self.inner.reading.set(false);
        let buf = Rc::try_unwrap(shared)
            .map(|cell| cell.into_inner())
            .unwrap_or_else(|rc| rc.borrow().clone());
        (buf, result)
    }

    /// Enqueues `buffer` on the writer task and suspends until all of
    /// `buffer[cursor..limit]` has been handed to the OS.
    pub async fn write(&self, buffer: Buffer) -> SokResult<()> {
        if self.inner.closed.get() || self.inner.close_after_drain.get() {
            return Err(SokError::SocketClosed);
        }
        let completion = Rc::new(RefCell::new(WriteCompletion {
            waker: None,
            result: None,
        }));
        self.inner.write_queue.borrow_mut().push_back(WriteQueueItem::Data {
            buffer,
            completion: completion.clone(),
        });
        self.inner.wake_writer();
        WriteFuture { completion }.await
    }

    /// Non-suspending variant of [`TcpStream::read`]: spawns the read on the
    /// runtime and returns a [`Promise`] the caller can await later.
    pub fn read_async(&self, mut buf: Buffer) -> Promise<(Buffer, SokResult<usize>)> {
        let (setter, promise) = Promise::new_pair();
        let stream = self.clone();
        self.inner.runtime.spawn(async move {
            let result = stream.read(&mut buf).await;
            setter.fulfill((buf, result));
        });
        promise
    }

    pub fn read_min_async(
        &self,
        mut buf: Buffer,
        min_to_read: usize,
    ) -> Promise<(Buffer, SokResult<usize>)> {
        let (setter, promise) = Promise::new_pair();
        let stream = self.clone();
        self.inner.runtime.spawn(async move {
            let result = stream.read_min(&mut buf, min_to_read).await;
            setter.fulfill((buf, result));
        });
        promise
    }

    pub fn write_async(&self, buffer: Buffer) -> Promise<SokResult<()>> {
        let (setter, promise) = Promise::new_pair();
        let stream = self.clone();
        self.inner.runtime.spawn(async move {
            let result = stream.write(buffer).await;
            setter.fulfill(result);
        });
        promise
    }

    /// Graceful close: enqueues a sentinel behind any writes already
    /// pending. Once the writer task drains to it, it shuts the write half
    /// down and the registration (and fd) close. In-flight reads observe
    /// `NormalClose` once that happens.
    pub fn close(&self) {
        if self.inner.closed.get() || self.inner.close_after_drain.replace(true) {
            return;
        }
        self.inner.write_queue.borrow_mut().push_back(WriteQueueItem::CloseAfterDrain);
        self.inner.wake_writer();
    }

    /// Immediately transitions to closed, dropping any queued writes (their
    /// completions resolve with `ForceClose`) and firing the close handler.
    pub fn force_close(&self) {
        if self.inner.closed.get() {
            return;
        }
        let dropped: Vec<_> = self.inner.write_queue.borrow_mut().drain(..).collect();
        for item in dropped {
            if let WriteQueueItem::Data { completion, .. } = item {
                let mut c = completion.borrow_mut();
                c.result = Some(Err(SokError::ForceClose));
                if let Some(w) = c.waker.take() {
                    w.wake();
                }
            }
        }
        self.inner.wake_writer();
        self.inner.terminate(SokError::ForceClose);
    }
}

struct WriteFuture {
    completion: Rc<RefCell<WriteCompletion>>,
}

impl std::future::Future for WriteFuture {
    type Output = SokResult<()>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut c = self.completion.borrow_mut();
        if let Some(result) = c.result.take() {
            return std::task::Poll::Ready(result);
        }
        c.waker = Some(cx.waker().clone());
        std::task::Poll::Pending
    }
}

struct WaitForQueue {
    inner: Rc<StreamInner>,
}

impl std::future::Future for WaitForQueue {
    type Output = ();

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<()> {
        if self.inner.closed.get() || !self.inner.write_queue.borrow().is_empty() {
            return std::task::Poll::Ready(());
        }
        *self.inner.write_waker.borrow_mut() = Some(cx.waker().clone());
        std::task::Poll::Pending
    }
}

async fn write_all(inner: &Rc<StreamInner>, buffer: &mut Buffer) -> SokResult<()> {
    loop {
        if buffer.remaining() == 0 {
            return Ok(());
        }
        let fd = inner.registration.fd();
        match raw_send(fd, buffer.active()) {
            Ok(n) => buffer.advance_cursor(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                inner.registration.select(Direction::Writable).await?;
            }
            Err(e) => {
                let cause = SokError::Io(e);
                inner.terminate(cause.clone());
                return Err(cause);
            }
        }
    }
}

/// The per-socket writer task: drains the FIFO, writing each item to
/// exhaustion before moving to the next, and idles (holding no writable
/// interest) whenever the queue is empty.
async fn writer_loop(inner: Rc<StreamInner>) {
    loop {
        if inner.closed.get() {
            return;
        }
        let item = inner.write_queue.borrow_mut().pop_front();
        let item = match item {
            Some(item) => item,
            None => {
                WaitForQueue { inner: inner.clone() }.await;
                continue;
            }
        };
        match item {
            WriteQueueItem::CloseAfterDrain => {
                let fd = inner.registration.fd();
                unsafe {
                    libc::shutdown(fd, libc::SHUT_WR);
                }
                inner.terminate(SokError::NormalClose);
                return;
            }
            WriteQueueItem::Data { mut buffer, completion } => {
                let result = write_all(&inner, &mut buffer).await;
                let mut c = completion.borrow_mut();
                c.result = Some(result);
                if let Some(w) = c.waker.take() {
                    w.wake();
                }
            }
        }
    }
}

/// Resolves `address:port`, creates a non-blocking stream socket, and
/// completes the non-blocking `connect` by suspending on writable
/// readiness and inspecting `SO_ERROR`.
pub async fn create_tcp_client_socket(
    runtime: &Runtime,
    address: &str,
    port: u16,
) -> SokResult<TcpStream> {
    let addr = (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| SokError::Io(io::Error::new(io::ErrorKind::InvalidInput, "no addresses resolved")))?;

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(SokError::Io(e)),
    }

    let fd = socket.as_raw_fd();
    let registration = runtime.selector().register(fd);

    registration.select(Direction::Writable).await?;

    match selector::socket_error(fd) {
        Some(0) | None => {}
        Some(errno) => {
            let cause = SokError::from_connect_errno(errno);
            registration.close(Some(cause.clone()));
            return Err(cause);
        }
    }

    Ok(TcpStream::from_parts(runtime.clone(), socket, registration, addr.to_string()))
}
