//! End-to-end scenarios, client and server driven on the same `Runtime` and
//! joined to completion with a small hand-rolled `Join2` combinator so the
//! test returns only once both sides have actually finished, rather than
//! racing on whichever task happens to resolve first.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use sok::{alloc_buffer, create_tcp_client_socket, create_tcp_server_socket, Direction, Runtime, SokError};

struct Join2 {
    a: Pin<Box<dyn Future<Output = ()>>>,
    b: Pin<Box<dyn Future<Output = ()>>>,
    a_done: bool,
    b_done: bool,
}

fn join2(a: impl Future<Output = ()> + 'static, b: impl Future<Output = ()> + 'static) -> Join2 {
    Join2 {
        a: Box::pin(a),
        b: Box::pin(b),
        a_done: false,
        b_done: false,
    }
}

impl Future for Join2 {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if !self.a_done && self.a.as_mut().poll(cx).is_ready() {
            self.a_done = true;
        }
        if !self.b_done && self.b.as_mut().poll(cx).is_ready() {
            self.b_done = true;
        }
        if self.a_done && self.b_done {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[test]
fn small_echo() {
    let runtime = Runtime::new().expect("runtime");
    let rt_server = runtime.clone();
    let rt_client = runtime.clone();
    let port = Rc::new(Cell::new(0u16));
    let port_for_server = port.clone();
    let server_closes = Rc::new(Cell::new(0u32));
    let server_closes2 = server_closes.clone();

    let server = async move {
        let listener = create_tcp_server_socket(&rt_server, "127.0.0.1", 0).await.expect("bind");
        port_for_server.set(listener.local_addr().unwrap().port());
        let conn = listener.accept().await.expect("accept");
        let closes = server_closes2.clone();
        conn.bind_close_handler(move |_| closes.set(closes.get() + 1));

        let mut buf = alloc_buffer(10);
        conn.read_min(&mut buf, 10).await.expect("server read");
        buf.set_cursor(0).unwrap();
        conn.write(buf).await.expect("server write");
        conn.close();

        let mut tail = alloc_buffer(1);
        let _ = conn.read(&mut tail).await;
        listener.close();
    };

    let client = async move {
        let port = port.get();
        let client = create_tcp_client_socket(&rt_client, "127.0.0.1", port).await.expect("connect");

        let mut out = alloc_buffer(10);
        for i in 0u8..10 {
            out.put_byte(i).unwrap();
        }
        out.set_cursor(0).unwrap();
        client.write(out).await.expect("client write");

        let mut inbuf = alloc_buffer(10);
        client.read_min(&mut inbuf, 10).await.expect("client read");
        assert_eq!(inbuf.to_array().unwrap(), (0u8..10).collect::<Vec<_>>());

        client.close();
        let mut tail = alloc_buffer(1);
        let result = client.read(&mut tail).await;
        assert!(matches!(result, Err(SokError::NormalClose) | Err(SokError::PeerClose)));
    };

    runtime.block_on(join2(server, client));
    assert_eq!(server_closes.get(), 1);
}

#[test]
fn chunked_read() {
    let runtime = Runtime::new().expect("runtime");
    let rt_server = runtime.clone();
    let rt_client = runtime.clone();
    let port = Rc::new(Cell::new(0u16));
    let port_for_server = port.clone();

    let server = async move {
        let listener = create_tcp_server_socket(&rt_server, "127.0.0.1", 0).await.expect("bind");
        port_for_server.set(listener.local_addr().unwrap().port());
        let conn = listener.accept().await.expect("accept");
        let mut buf = alloc_buffer(30);
        for i in 0u8..30 {
            buf.put_byte(i).unwrap();
        }
        buf.set_cursor(0).unwrap();
        conn.write(buf).await.expect("write 30");
        conn.close();
    };

    let client = async move {
        let port = port.get();
        let client = create_tcp_client_socket(&rt_client, "127.0.0.1", port).await.expect("connect");
        let mut received = Vec::new();
        for _ in 0..3 {
            let mut chunk = alloc_buffer(10);
            let n = client.read_min(&mut chunk, 10).await.expect("chunk read");
            assert_eq!(n, 10);
            received.extend(chunk.to_array().unwrap());
        }
        assert_eq!(received, (0u8..30).collect::<Vec<_>>());
    };

    runtime.block_on(join2(server, client));
}

#[test]
fn min_to_read() {
    let runtime = Runtime::new().expect("runtime");
    let rt_server = runtime.clone();
    let rt_client = runtime.clone();
    let port = Rc::new(Cell::new(0u16));
    let port_for_server = port.clone();

    let server = async move {
        let listener = create_tcp_server_socket(&rt_server, "127.0.0.1", 0).await.expect("bind");
        port_for_server.set(listener.local_addr().unwrap().port());
        let conn = listener.accept().await.expect("accept");

        let mut first = alloc_buffer(4);
        for i in 0u8..4 {
            first.put_byte(i).unwrap();
        }
        first.set_cursor(0).unwrap();
        conn.write(first).await.expect("write first 4");

        // A delay-free stand-in for "wait 10ms": the writer task idles
        // with no queued interest in between, so the client's read_min
        // genuinely observes two distinct deliveries.
        let mut second = alloc_buffer(4);
        for i in 4u8..8 {
            second.put_byte(i).unwrap();
        }
        second.set_cursor(0).unwrap();
        conn.write(second).await.expect("write second 4");
        conn.close();
    };

    let client = async move {
        let port = port.get();
        let client = create_tcp_client_socket(&rt_client, "127.0.0.1", port).await.expect("connect");
        let mut buf = alloc_buffer(16);
        let n = client.read_min(&mut buf, 8).await.expect("read_min(8)");
        assert_eq!(n, 8);
        assert_eq!(buf.get_bytes_at(0, 8).unwrap(), (0u8..8).collect::<Vec<_>>());
        // Bytes beyond the cursor are untouched zero-fill, not garbage.
        assert_eq!(buf.get_bytes_at(8, 8).unwrap(), vec![0u8; 8]);
    };

    runtime.block_on(join2(server, client));
}

#[test]
fn bulk_read_throughput() {
    const CHUNK: usize = 65536;
    const CHUNKS: usize = 64;
    const TOTAL: usize = CHUNK * CHUNKS;

    let runtime = Runtime::new().expect("runtime");
    let rt_server = runtime.clone();
    let rt_client = runtime.clone();
    let port = Rc::new(Cell::new(0u16));
    let port_for_server = port.clone();

    let server = async move {
        let listener = create_tcp_server_socket(&rt_server, "127.0.0.1", 0).await.expect("bind");
        port_for_server.set(listener.local_addr().unwrap().port());
        let conn = listener.accept().await.expect("accept");
        for _ in 0..CHUNKS {
            let buf = alloc_buffer(CHUNK);
            conn.write(buf).await.expect("write chunk");
        }
        conn.close();
    };

    let client = async move {
        let port = port.get();
        let client = create_tcp_client_socket(&rt_client, "127.0.0.1", port).await.expect("connect");
        let received = Rc::new(Cell::new(0usize));
        let received_cb = received.clone();
        let buf = alloc_buffer(CHUNK);
        let (_buf, result) = client
            .bulk_read(buf, move |b| {
                received_cb.set(received_cb.get() + b.get_cursor());
                received_cb.get() >= TOTAL
            })
            .await;
        assert!(result.is_ok() || matches!(result, Err(SokError::PeerClose)));
        assert_eq!(received.get(), TOTAL);

        let mut probe = alloc_buffer(1);
        let follow_up = client.read(&mut probe).await;
        assert!(!matches!(follow_up, Err(SokError::ConcurrentReading)));
    };

    runtime.block_on(join2(server, client));
}

#[test]
fn graceful_close_drains_writes() {
    const ITEM: usize = 65536;
    const COUNT: usize = 10;
    const TOTAL: usize = ITEM * COUNT;

    let runtime = Runtime::new().expect("runtime");
    let rt_server = runtime.clone();
    let rt_client = runtime.clone();
    let port = Rc::new(Cell::new(0u16));
    let port_for_server = port.clone();
    let received = Rc::new(Cell::new(0usize));
    let received2 = received.clone();

    let server = async move {
        let listener = create_tcp_server_socket(&rt_server, "127.0.0.1", 0).await.expect("bind");
        port_for_server.set(listener.local_addr().unwrap().port());
        let conn = listener.accept().await.expect("accept");
        loop {
            let mut buf = alloc_buffer(8192);
            match conn.read(&mut buf).await {
                Ok(n) => received2.set(received2.get() + n),
                Err(_) => break,
            }
        }
    };

    let client = async move {
        let port = port.get();
        let client = create_tcp_client_socket(&rt_client, "127.0.0.1", port).await.expect("connect");

        let exception: Rc<RefCell<Option<SokError>>> = Rc::new(RefCell::new(None));
        let exception2 = exception.clone();
        client.bind_exception_handler(move |e| *exception2.borrow_mut() = Some(e));

        let mut promises = Vec::with_capacity(COUNT);
        for _ in 0..COUNT {
            promises.push(client.write_async(alloc_buffer(ITEM)));
        }
        client.close();
        for p in promises {
            p.await.expect("drained write");
        }

        let mut tail = alloc_buffer(1);
        let _ = client.read(&mut tail).await;
        assert!(matches!(*exception.borrow(), Some(SokError::NormalClose)));
    };

    runtime.block_on(join2(server, client));
    assert_eq!(received.get(), TOTAL);
}

#[test]
fn force_close_drops_writes() {
    const ITEM: usize = 65536;
    const COUNT: usize = 10;
    const TOTAL: usize = ITEM * COUNT;

    let runtime = Runtime::new().expect("runtime");
    let rt_server = runtime.clone();
    let rt_client = runtime.clone();
    let port = Rc::new(Cell::new(0u16));
    let port_for_server = port.clone();
    let received = Rc::new(Cell::new(0usize));
    let received2 = received.clone();

    let server = async move {
        let listener = create_tcp_server_socket(&rt_server, "127.0.0.1", 0).await.expect("bind");
        port_for_server.set(listener.local_addr().unwrap().port());
        let conn = listener.accept().await.expect("accept");
        loop {
            let mut buf = alloc_buffer(8192);
            match conn.read(&mut buf).await {
                Ok(n) => received2.set(received2.get() + n),
                Err(_) => break,
            }
        }
    };

    let client = async move {
        let port = port.get();
        let client = create_tcp_client_socket(&rt_client, "127.0.0.1", port).await.expect("connect");

        // One write awaited fully, so the server is guaranteed to observe
        // at least some bytes before the rest are dropped.
        client.write(alloc_buffer(ITEM)).await.expect("first write");

        let mut promises = Vec::with_capacity(COUNT - 1);
        for _ in 0..(COUNT - 1) {
            promises.push(client.write_async(alloc_buffer(ITEM)));
        }
        client.force_close();
        for p in promises {
            let result = p.await;
            assert!(matches!(result, Err(SokError::ForceClose)));
        }
    };

    runtime.block_on(join2(server, client));
    assert!(received.get() >= ITEM);
    assert!(received.get() < TOTAL);
}

#[test]
fn connection_refused() {
    let runtime = Runtime::new().expect("runtime");
    let rt = runtime.clone();

    // Grab an ephemeral port, then drop the probe immediately so nothing
    // is listening by the time the real attempt connects.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let result = runtime.block_on(async move { create_tcp_client_socket(&rt, "127.0.0.1", port).await });
    assert!(matches!(result, Err(SokError::ConnectionRefused)));
}

#[test]
fn selector_round_trip() {
    let runtime = Runtime::new().expect("runtime");

    let (mut a, mut b) = UnixStream::pair().expect("socketpair");
    a.set_nonblocking(true).expect("nonblocking a");
    b.set_nonblocking(true).expect("nonblocking b");
    let reg_a = runtime.selector().register(a.as_raw_fd());
    let reg_b = runtime.selector().register(b.as_raw_fd());

    runtime.block_on(async move {
        for i in 0u64..200 {
            let wire = i.to_be_bytes();
            loop {
                match a.write(&wire) {
                    Ok(8) => break,
                    Ok(_) => panic!("partial write on a unix socket pair"),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        reg_a.select(Direction::Writable).await.unwrap();
                    }
                    Err(e) => panic!("write failed: {e}"),
                }
            }

            let mut buf = [0u8; 8];
            let mut filled = 0;
            while filled < 8 {
                match b.read(&mut buf[filled..]) {
                    Ok(0) => panic!("unexpected eof"),
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        reg_b.select(Direction::Readable).await.unwrap();
                    }
                    Err(e) => panic!("read failed: {e}"),
                }
            }
            assert_eq!(u64::from_be_bytes(buf), i, "round trip must be bit-identical");
        }
    });
}
