//! TCP transport and session lifecycle.
//!
//! The server accepts one debugger at a time on the loopback interface.
//! A [`Session`] owns the socket, the receive buffer and the breakpoint table,
//! and alternates between reading client bytes and delivering stop
//! notifications posted by the engine bridge. Further connection attempts are
//! refused while a session is active.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use xgdb_engine::Engine;

use crate::breakpoints::BreakpointManager;
use crate::bridge::ExecutionBridge;
use crate::cache::SharedCache;
use crate::dispatch::{Dispatcher, Response, stop_reply};
use crate::error::{Result, StubError};
use crate::metrics;
use crate::packet::{self, Frame, PacketBuffer};

/// Longest the session blocks on one source before checking the other.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Socket read timeout while a stop reply is outstanding.
const SHORT_READ: Duration = Duration::from_millis(1);

/// What happens to client breakpoints when a session ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DetachPolicy {
    /// Uninstall every breakpoint the client set.
    #[default]
    ClearBreakpoints,
    /// Leave breakpoints installed in the engine.
    KeepBreakpoints,
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct StubConfig {
    /// TCP port on 127.0.0.1. Port 0 picks a free port.
    pub port: u16,
    /// Accept a new client after a session ends.
    pub reconnect: bool,
    pub detach_policy: DetachPolicy,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            reconnect: true,
            detach_policy: DetachPolicy::default(),
        }
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed the connection.
    ClientClosed,
    /// Client sent `D`.
    Detached,
    /// Client sent `k` or `vKill`.
    Killed,
    /// The guest program terminated.
    GuestEnded,
    /// Another debugger took over the engine.
    FocusLost,
}

/// Debug server bound to a local port.
pub struct GdbServer {
    engine: Arc<dyn Engine>,
    listener: TcpListener,
    config: StubConfig,
}

impl GdbServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`StubError::Bind`] if the port cannot be bound.
    pub fn bind(engine: Arc<dyn Engine>, config: StubConfig) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
        let listener = TcpListener::bind(addr).map_err(|source| StubError::Bind {
            port: config.port,
            source,
        })?;
        Ok(Self {
            engine,
            listener,
            config,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the socket address cannot be queried.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients until the guest ends, or after one session when
    /// reconnecting is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a connection fails.
    pub fn serve(&self) -> Result<()> {
        loop {
            let end = self.serve_one()?;
            if end == SessionEnd::GuestEnded || !self.config.reconnect {
                return Ok(());
            }
        }
    }

    /// Accept one client and run its session to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails. Socket failures during the session
    /// are logged and reported as [`SessionEnd::ClientClosed`].
    pub fn serve_one(&self) -> Result<SessionEnd> {
        let addr = self.local_addr()?;
        info!(%addr, "waiting for debugger connection");
        self.listener.set_nonblocking(false)?;
        let (stream, peer) = self.listener.accept()?;
        info!(%peer, "debugger connected");
        metrics::record_session();

        self.listener.set_nonblocking(true)?;
        let mut session = Session::start(
            Arc::clone(&self.engine),
            stream,
            &self.listener,
            self.config.detach_policy,
        )?;
        let end = session.run().unwrap_or_else(|e| {
            warn!(error = %e, "session aborted");
            SessionEnd::ClientClosed
        });
        drop(session);
        info!(reason = ?end, "session ended");
        Ok(end)
    }
}

/// One connected debugger.
struct Session<'a> {
    engine: Arc<dyn Engine>,
    cache: Arc<SharedCache>,
    breakpoints: BreakpointManager,
    stream: TcpStream,
    listener: &'a TcpListener,
    buffer: PacketBuffer,
    last_sent: Vec<u8>,
    // A resume was dispatched and its stop reply is still owed.
    awaiting_stop: bool,
    detach_policy: DetachPolicy,
}

impl<'a> Session<'a> {
    fn start(
        engine: Arc<dyn Engine>,
        stream: TcpStream,
        listener: &'a TcpListener,
        detach_policy: DetachPolicy,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        let cache = Arc::new(SharedCache::new());
        engine.attach(Arc::new(ExecutionBridge::new(Arc::clone(&cache), &engine)));
        {
            // Seed after attaching so a pause racing the attach is not lost.
            let mut state = cache.lock();
            if engine.is_paused() {
                state.refresh(engine.as_ref());
                state.mark_stopped();
            } else {
                state.refresh_modules(engine.as_ref());
            }
        }
        Ok(Self {
            breakpoints: BreakpointManager::new(Arc::clone(&engine)),
            engine,
            cache,
            stream,
            listener,
            buffer: PacketBuffer::new(),
            last_sent: Vec::new(),
            awaiting_stop: false,
            detach_policy,
        })
    }

    fn run(&mut self) -> Result<SessionEnd> {
        let mut chunk = [0u8; 4096];
        loop {
            self.reject_pending_clients();
            if let Some(end) = self.deliver_notifications()? {
                return Ok(end);
            }

            let timeout = if self.awaiting_stop { SHORT_READ } else { POLL_INTERVAL };
            self.stream.set_read_timeout(Some(timeout))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(SessionEnd::ClientClosed),
                Ok(n) => {
                    self.buffer.extend(&chunk[..n]);
                    while let Some(frame) = self.buffer.next_frame() {
                        if let Some(end) = self.handle_frame(frame)? {
                            return Ok(end);
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    return Ok(SessionEnd::ClientClosed);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send the pending stop notification, if any.
    fn deliver_notifications(&mut self) -> Result<Option<SessionEnd>> {
        let wait = if self.awaiting_stop { POLL_INTERVAL } else { Duration::ZERO };
        let wakeup = self.cache.wait(wait);
        if let Some(notification) = wakeup.notification {
            let reply = stop_reply(&notification, wakeup.current_thread);
            debug!(?notification, %reply, "delivering stop notification");
            self.send(&reply)?;
            metrics::record_notification();
            self.awaiting_stop = false;
        }
        if wakeup.terminated {
            return Ok(Some(SessionEnd::GuestEnded));
        }
        if wakeup.detached {
            return Ok(Some(SessionEnd::FocusLost));
        }
        Ok(None)
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<SessionEnd>> {
        match frame {
            Frame::Packet(command) => {
                self.stream.write_all(b"+")?;
                trace!(packet = %command.payload(), "<-");
                metrics::record_packet(&command.verb);
                let response =
                    Dispatcher::new(self.engine.as_ref(), &self.cache, &mut self.breakpoints)
                        .dispatch(&command);
                match response {
                    Response::Reply(reply) => self.send(&reply)?,
                    Response::Deferred => self.awaiting_stop = true,
                    Response::Detach => {
                        self.send("OK")?;
                        return Ok(Some(SessionEnd::Detached));
                    }
                    Response::Kill => return Ok(Some(SessionEnd::Killed)),
                }
            }
            Frame::Corrupt => {
                debug!("rejecting corrupt packet");
                metrics::record_rejected();
                self.stream.write_all(b"-")?;
            }
            Frame::Interrupt => {
                debug!("interrupt requested");
                if Dispatcher::new(self.engine.as_ref(), &self.cache, &mut self.breakpoints)
                    .interrupt()
                {
                    self.awaiting_stop = true;
                }
            }
            Frame::Ack => {}
            Frame::Nack => {
                if !self.last_sent.is_empty() {
                    self.stream.write_all(&self.last_sent)?;
                }
            }
        }
        Ok(None)
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        trace!(packet = %payload, "->");
        self.last_sent = packet::encode(payload);
        self.stream.write_all(&self.last_sent)?;
        metrics::record_reply();
        Ok(())
    }

    /// Refuse connections that arrive while this session is active.
    fn reject_pending_clients(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    warn!(%peer, "debugger already attached, refusing connection");
                    let _ = stream.shutdown(Shutdown::Both);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        match self.detach_policy {
            DetachPolicy::ClearBreakpoints => self.breakpoints.clear_all(),
            DetachPolicy::KeepBreakpoints => self.breakpoints.forget_all(),
        }
        self.engine.detach();
        if self.engine.is_paused() {
            if let Err(e) = self.engine.resume() {
                debug!(error = %e, "guest not resumed on detach");
            }
        }
        self.cache.lock().reset();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
