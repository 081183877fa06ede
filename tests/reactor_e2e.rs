//! End-to-end reactor scenarios: echo, mixed-family stress, connect
//! failure, peer reset, request/response with close, and shutdown
//! timing.

mod common;

use common::{init_logging, wait_until};
use eventide::{
    async_write, config, safely_close, Family, IoObject, StreamIo, TcpClient, TcpServer,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GREETING: &[u8] = b"Eventide is an event driven library";

#[test]
fn tcp_echo_ipv4() {
    init_logging();

    let server_got: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let server_closed = Arc::new(AtomicUsize::new(0));

    let mut server = TcpServer::new(2, true, None).expect("server");
    server.set_on_accept(Arc::new(|sock| {
        sock.io().wbuffer().put_slice(GREETING);
        async_write(sock);
    }));
    let got = server_got.clone();
    server.set_on_read_complete(Arc::new(move |sock| {
        let payload = sock.io().rbuffer().get_bytes(None, true);
        got.lock().extend_from_slice(&payload);
        sock.io().wbuffer().put_slice(&payload);
        async_write(sock);
    }));
    let closed = server_closed.clone();
    server.set_on_closed(Arc::new(move |_| {
        closed.fetch_add(1, Ordering::SeqCst);
    }));
    server
        .listen(18884, Family::Ipv4, Some("127.0.0.1"))
        .expect("listen");
    server.run().expect("server run");

    let client_got: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let client_closed = Arc::new(AtomicUsize::new(0));

    let mut client = TcpClient::new(2, 1, None).expect("client");
    client.set_on_connect(Arc::new(|sock| {
        sock.io().wbuffer().put_slice(b"0123456789");
        async_write(sock);
    }));
    let got = client_got.clone();
    client.set_on_read_complete(Arc::new(move |sock| {
        got.lock()
            .extend_from_slice(&sock.io().rbuffer().get_bytes(None, true));
    }));
    let closed = client_closed.clone();
    client.set_on_closed(Arc::new(move |_| {
        closed.fetch_add(1, Ordering::SeqCst);
    }));
    client.run().expect("client run");
    client.add("127.0.0.1", 18884, Family::Ipv4, 1);

    // The client ends up with the 35-byte greeting plus its own ten
    // bytes echoed back.
    assert!(wait_until(Duration::from_secs(5), || client_got.lock().len()
        >= GREETING.len() + 10));

    let received = client_got.lock().clone();
    assert_eq!(&received[..GREETING.len()], GREETING);
    assert_eq!(&received[GREETING.len()..], b"0123456789");
    assert_eq!(server_got.lock().as_slice(), b"0123456789");

    // Steady state: nobody saw a close.
    assert_eq!(server_closed.load(Ordering::SeqCst), 0);
    assert_eq!(client_closed.load(Ordering::SeqCst), 0);

    client.shutdown();
    server.shutdown();
}

#[test]
fn stress_mixed_families() {
    init_logging();
    const PER_FAMILY: usize = 20;
    let unix_path = "/tmp/eventide_stress_e2e.sock";

    let accepted = Arc::new(AtomicUsize::new(0));
    let server_closed = Arc::new(AtomicUsize::new(0));

    let mut server = TcpServer::new(4, true, None).expect("server");
    let acc = accepted.clone();
    server.set_on_accept(Arc::new(move |_| {
        acc.fetch_add(1, Ordering::SeqCst);
    }));
    let closed = server_closed.clone();
    server.set_on_closed(Arc::new(move |_| {
        closed.fetch_add(1, Ordering::SeqCst);
    }));
    server
        .listen(18885, Family::Ipv4, Some("127.0.0.1"))
        .expect("listen v4");
    server.listen(18886, Family::Ipv6, Some("::1")).expect("listen v6");
    server.listen_unix(unix_path, true).expect("listen unix");
    server.run().expect("server run");

    let connected = Arc::new(AtomicUsize::new(0));
    let mut client = TcpClient::new(4, 2, None).expect("client");
    let conn = connected.clone();
    client.set_on_connect(Arc::new(move |_| {
        conn.fetch_add(1, Ordering::SeqCst);
    }));
    client.run().expect("client run");

    client.add("127.0.0.1", 18885, Family::Ipv4, PER_FAMILY as u32);
    client.add("::1", 18886, Family::Ipv6, PER_FAMILY as u32);
    client.add_unix(unix_path, PER_FAMILY as u32);

    assert!(wait_until(Duration::from_secs(10), || {
        accepted.load(Ordering::SeqCst) == 3 * PER_FAMILY
            && connected.load(Ordering::SeqCst) == 3 * PER_FAMILY
    }));
    assert!(client.failures().is_empty());
    assert_eq!(server_closed.load(Ordering::SeqCst), 0);

    client.shutdown();
    server.shutdown();
    let _ = std::fs::remove_file(unix_path);
}

#[test]
fn connect_failure_is_recorded_not_delivered() {
    init_logging();

    let connected = Arc::new(AtomicUsize::new(0));
    let mut client = TcpClient::new(1, 1, None).expect("client");
    let conn = connected.clone();
    client.set_on_connect(Arc::new(move |_| {
        conn.fetch_add(1, Ordering::SeqCst);
    }));
    client.run().expect("client run");

    // Nothing listens on port 1.
    client.add("127.0.0.1", 1, Family::Ipv4, 1);

    assert!(wait_until(Duration::from_secs(5), || {
        client.failures().values().sum::<u32>() == 1
    }));
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    let failures = client.failures();
    let (host, count) = failures.iter().next().expect("one failure");
    assert_eq!(host.addr, "127.0.0.1");
    assert_eq!(host.port, 1);
    assert_eq!(*count, 1);

    client.shutdown();
}

#[test]
fn peer_reset_surfaces_once() {
    init_logging();

    let mut server = TcpServer::new(1, true, None).expect("server");
    server.set_on_read_complete(Arc::new(|sock| {
        // Discard unsent data and answer with a reset on close.
        let _ = sock.io().rbuffer().get_bytes(None, true);
        sock.set_linger(true, 0).expect("set_linger");
        safely_close(sock);
    }));
    server
        .listen(18887, Family::Ipv4, Some("127.0.0.1"))
        .expect("listen");
    server.run().expect("server run");

    let closed = Arc::new(AtomicUsize::new(0));
    let was_reset = Arc::new(AtomicBool::new(false));

    let mut client = TcpClient::new(1, 1, None).expect("client");
    client.set_on_connect(Arc::new(|sock| {
        sock.io().wbuffer().put_slice(b"trigger");
        async_write(sock);
    }));
    let closed2 = closed.clone();
    let was_reset2 = was_reset.clone();
    client.set_on_closed(Arc::new(move |sock| {
        closed2.fetch_add(1, Ordering::SeqCst);
        was_reset2.store(sock.is_reset(), Ordering::SeqCst);
    }));
    client.run().expect("client run");
    client.add("127.0.0.1", 18887, Family::Ipv4, 1);

    assert!(wait_until(Duration::from_secs(5), || closed
        .load(Ordering::SeqCst)
        >= 1));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(was_reset.load(Ordering::SeqCst));

    client.shutdown();
    server.shutdown();
}

#[test]
fn file_request_response_close() {
    init_logging();

    let file_path = "/tmp/eventide_file_e2e.bin";
    let mut payload = Vec::with_capacity(100_000);
    for i in 0..100_000u32 {
        payload.push((i % 251) as u8);
    }
    std::fs::write(file_path, &payload).expect("write test file");

    let mut server = TcpServer::new(2, true, None).expect("server");
    server.set_on_read_complete(Arc::new(|sock| {
        // Wait for a full newline-terminated request line.
        let request = {
            let mut rbuf = sock.io().rbuffer();
            let pending = rbuf.peek(usize::MAX);
            if pending.last() != Some(&b'\n') {
                return;
            }
            rbuf.consume(pending.len());
            pending
        };
        let name = String::from_utf8_lossy(&request[..request.len() - 1]).into_owned();
        match std::fs::read(&name) {
            Ok(bytes) => {
                sock.io().wbuffer().put_slice(&bytes);
                async_write(sock);
            }
            Err(_) => safely_close(sock),
        }
    }));
    server.set_on_write_complete(Arc::new(|sock| {
        safely_close(sock);
    }));
    server
        .listen(18889, Family::Ipv4, Some("127.0.0.1"))
        .expect("listen");
    server.run().expect("server run");

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let mut client = TcpClient::new(2, 1, None).expect("client");
    client.set_on_connect(Arc::new(move |sock| {
        sock.io().wbuffer().put_slice(file_path.as_bytes());
        sock.io().wbuffer().put_slice(b"\n");
        async_write(sock);
    }));
    let sink = received.clone();
    client.set_on_read_complete(Arc::new(move |sock| {
        sink.lock()
            .extend_from_slice(&sock.io().rbuffer().get_bytes(None, true));
    }));
    let done2 = done.clone();
    client.set_on_closed(Arc::new(move |_| {
        done2.store(true, Ordering::SeqCst);
    }));
    client.run().expect("client run");
    client.add("127.0.0.1", 18889, Family::Ipv4, 1);

    assert!(wait_until(Duration::from_secs(10), || done
        .load(Ordering::SeqCst)));
    assert_eq!(received.lock().as_slice(), payload.as_slice());

    client.shutdown();
    server.shutdown();
    let _ = std::fs::remove_file(file_path);
}

#[test]
fn graceful_shutdown_timing() {
    init_logging();
    const CONNECTIONS: usize = 100;

    let accepted = Arc::new(AtomicUsize::new(0));
    let mut server = TcpServer::new(8, true, None).expect("server");
    let acc = accepted.clone();
    server.set_on_accept(Arc::new(move |_| {
        acc.fetch_add(1, Ordering::SeqCst);
    }));
    server
        .listen(18888, Family::Ipv4, Some("127.0.0.1"))
        .expect("listen");
    server.run().expect("server run");

    let connected = Arc::new(AtomicUsize::new(0));
    let mut client = TcpClient::new(2, 2, None).expect("client");
    let conn = connected.clone();
    client.set_on_connect(Arc::new(move |_| {
        conn.fetch_add(1, Ordering::SeqCst);
    }));
    client.run().expect("client run");
    client.add("127.0.0.1", 18888, Family::Ipv4, CONNECTIONS as u32);

    assert!(wait_until(Duration::from_secs(10), || {
        accepted.load(Ordering::SeqCst) == CONNECTIONS
            && connected.load(Ordering::SeqCst) == CONNECTIONS
    }));

    let accepted_at_shutdown = accepted.load(Ordering::SeqCst);
    let start = Instant::now();
    server.shutdown();
    let elapsed = start.elapsed();
    assert!(
        elapsed < config::reactor_shutdown_timeout() + Duration::from_secs(3),
        "shutdown took {elapsed:?}"
    );

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(accepted.load(Ordering::SeqCst), accepted_at_shutdown);

    client.shutdown();
}
