//! Shared helpers for session tests: a server on an ephemeral port and a
//! minimal protocol client.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use xgdb::packet::{self, Frame};
use xgdb::{GdbServer, StubConfig};
use xgdb_engine::SimEngine;

pub const BASE: u64 = 0x0010_0000;
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Guest with two threads and one mapped module, paused at start.
pub fn sim() -> Arc<SimEngine> {
    Arc::new(
        SimEngine::builder()
            .region(BASE, 0x1_0000)
            .module("default.xex", BASE, 0x1_0000)
            .thread("main", BASE)
            .thread("worker", BASE + 0x1000)
            .build(),
    )
}

pub struct Harness {
    pub sim: Arc<SimEngine>,
    pub addr: SocketAddr,
    pub server: JoinHandle<xgdb::Result<()>>,
}

/// Bind on port 0 and serve on a background thread.
pub fn start(sim: Arc<SimEngine>, config: StubConfig) -> Harness {
    let server = GdbServer::bind(sim.clone(), StubConfig { port: 0, ..config })
        .expect("bind failed");
    let addr = server.local_addr().expect("no local address");
    let server = thread::spawn(move || server.serve());
    Harness { sim, addr, server }
}

pub fn start_oneshot(sim: Arc<SimEngine>) -> Harness {
    start(
        sim,
        StubConfig {
            reconnect: false,
            ..StubConfig::default()
        },
    )
}

/// Poll `condition` until it holds or [`TIMEOUT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Protocol client that acknowledges every packet it receives.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream.set_read_timeout(Some(TIMEOUT)).expect("set timeout");
        stream.set_nodelay(true).expect("set nodelay");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write failed");
    }

    pub fn send(&mut self, payload: &str) {
        self.send_raw(&packet::encode(payload));
    }

    /// Next frame other than a bare `+`, or `None` on timeout or close.
    pub fn next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let (frame, consumed) = packet::decode(&self.buf);
            self.buf.drain(..consumed);
            match frame {
                Some(Frame::Ack) => continue,
                Some(frame) => return Some(frame),
                None => {}
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .expect("set timeout");
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return None;
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    /// Next packet payload, or `None` if nothing arrives within `timeout`.
    pub fn try_recv(&mut self, timeout: Duration) -> Option<String> {
        match self.next_frame(timeout)? {
            Frame::Packet(command) => {
                self.send_raw(b"+");
                Some(command.payload())
            }
            other => panic!("unexpected frame from server: {other:?}"),
        }
    }

    pub fn recv(&mut self) -> String {
        self.try_recv(TIMEOUT).expect("no reply from server")
    }

    pub fn request(&mut self, payload: &str) -> String {
        self.send(payload);
        self.recv()
    }

    /// Whether the server closed the connection within [`TIMEOUT`].
    pub fn is_closed(&mut self) -> bool {
        self.stream.set_read_timeout(Some(TIMEOUT)).expect("set timeout");
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }
}
