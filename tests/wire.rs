// tests/wire.rs
//
// End-to-end exercises against a real reactor on a loopback socket. Each
// test spins up its own reactor on port 0 and shuts it down through a stop
// handle.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use arclight::reactor::{Reactor, StopHandle};
use arclight::response;

struct TestServer {
    addr: SocketAddr,
    stop: StopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(capacity: usize) -> Self {
        let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), capacity).unwrap();
        let addr = reactor.local_addr().unwrap();
        let stop = reactor.stop_handle();
        let thread = thread::spawn(move || reactor.run());
        Self {
            addr,
            stop,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    out
}

#[test]
fn single_write_request_gets_the_canned_response_then_close() {
    let server = TestServer::start(1024);
    let mut stream = server.connect();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let got = read_until_close(&mut stream);
    assert_eq!(got, response::render());

    let text = String::from_utf8(got).unwrap();
    let body_start = text.find("\r\n\r\n").unwrap() + 4;
    assert!(text.contains(&format!(
        "Content-Length: {}\r\n",
        text.len() - body_start
    )));
}

#[test]
fn split_request_stays_silent_until_the_terminator_arrives() {
    let server = TestServer::start(1024);
    let mut stream = server.connect();

    stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
    thread::sleep(Duration::from_millis(150));

    // Nothing may come back while the request is incomplete.
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut probe = [0u8; 16];
    match stream.read(&mut probe) {
        Err(e) => assert!(
            e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut,
            "unexpected error while waiting: {}",
            e
        ),
        Ok(n) => panic!("server sent {} bytes before the request completed", n),
    }

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"Host: x\r\n\r\n").unwrap();

    let got = read_until_close(&mut stream);
    assert_eq!(got, response::render());
}

#[test]
fn request_delivered_in_tiny_chunks_still_completes() {
    let server = TestServer::start(1024);
    let mut stream = server.connect();

    let request = b"GET /anything HTTP/1.1\r\nHost: fragmented\r\n\r\n";
    for chunk in request.chunks(3) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let got = read_until_close(&mut stream);
    assert_eq!(got, response::render());
}

#[test]
fn terminator_free_flood_is_dropped_without_a_response() {
    let server = TestServer::start(1024);
    let mut stream = server.connect();

    // More than the 8 KiB read buffer, no CRLFCRLF anywhere.
    let flood = vec![b'A'; 10 * 1024];
    // The server may reset mid-write once its buffer fills; that is fine.
    let _ = stream.write_all(&flood);

    let got = read_until_close(&mut stream);
    assert!(
        got.is_empty(),
        "expected zero response bytes, got {}",
        got.len()
    );
}

#[test]
fn descriptor_beyond_table_capacity_is_rejected() {
    // Capacity 4 is below any descriptor the kernel can hand out here
    // (stdio plus the reactor's own listener, epoll and wake pipe are all
    // lower-numbered), so every accept must take the rejection path.
    let server = TestServer::start(4);
    let mut stream = server.connect();

    let got = read_until_close(&mut stream);
    assert_eq!(got, b"Error.");
}

#[test]
fn concurrent_connections_each_get_a_full_response() {
    let server = TestServer::start(1024);

    let mut streams: Vec<TcpStream> = (0..8).map(|_| server.connect()).collect();
    for stream in &mut streams {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: many\r\n\r\n")
            .unwrap();
    }

    let expected = response::render();
    for mut stream in streams {
        assert_eq!(read_until_close(&mut stream), expected);
    }
}

#[test]
fn idle_reactor_shuts_down_promptly() {
    let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), 64).unwrap();
    let stop = reactor.stop_handle();

    let started = std::time::Instant::now();
    let handle = thread::spawn(move || reactor.run());
    thread::sleep(Duration::from_millis(20));

    // No connections, no pending I/O: only the wake pipe can end the wait.
    stop.stop();
    handle.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}
