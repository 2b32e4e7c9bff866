//! mio event loop.
//!
//! Readiness-based model: poll tells us which sockets are ready, then the
//! connection state machine performs non-blocking reads and writes until they
//! would block. Uses epoll on Linux and kqueue on macOS.
//!
//! A single thread owns the poll, the listener and the connection table, so
//! nothing here is locked. The only thing shared with other threads is the
//! [`StopHandle`] flag, checked once per iteration.

use crate::runtime::acceptor;
use crate::runtime::connection::{CloseReason, ConnectionRegistry};
use mio::event::{Event, Source};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);

/// The poller refused a registration.
#[derive(Debug, Error)]
#[error("failed to register {token:?}: {source}")]
pub struct RegistrationError {
    pub token: Token,
    #[source]
    pub source: io::Error,
}

/// Errors that end the event loop.
#[derive(Debug, Error)]
pub enum EventLoopError {
    #[error("failed to create poller: {0}")]
    Init(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
    #[error("event loop thread panicked")]
    Panicked,
}

/// One ready socket as reported by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Cloneable request to stop an event loop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the loop to stop. Takes effect at the next iteration boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Register `source` under `token`. Every registration the loop makes goes
/// through here.
pub(crate) fn register<S>(
    registry: &Registry,
    source: &mut S,
    token: Token,
    interest: Interest,
) -> Result<(), RegistrationError>
where
    S: Source + ?Sized,
{
    registry
        .register(source, token, interest)
        .map_err(|source| RegistrationError { token, source })
}

/// Event loop settings.
#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    /// Upper bound on one readiness wait.
    pub poll_timeout: Duration,
    /// Events collected per wait.
    pub max_events: usize,
    /// Connections held at once.
    pub max_connections: usize,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    poll_timeout: Duration,
    stop: StopHandle,
}

impl EventLoop {
    /// Create a loop serving `listener`, registering it for readability.
    pub fn new(mut listener: TcpListener, options: LoopOptions) -> Result<Self, EventLoopError> {
        let poll = Poll::new().map_err(EventLoopError::Init)?;
        register(poll.registry(), &mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(options.max_events),
            listener,
            connections: ConnectionRegistry::new(options.max_connections),
            poll_timeout: options.poll_timeout,
            stop: StopHandle::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of connections in the table.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request termination at the next iteration boundary.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Register a source with the poller.
    pub fn register<S>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), RegistrationError>
    where
        S: Source + ?Sized,
    {
        register(self.poll.registry(), source, token, interest)
    }

    /// Wait up to `timeout` for readiness.
    ///
    /// Returns ready sockets in the order the poller reported them, or an
    /// empty list on timeout. `None` waits indefinitely.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<Vec<Readiness>, EventLoopError> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EventLoopError::Poll(e)),
            }
        }

        Ok(self.events.iter().map(Readiness::from).collect())
    }

    /// Handle one batch of readiness.
    ///
    /// Connections that close during the batch are removed after it, so a
    /// freed slab key cannot be handed to a new connection mid-batch.
    pub fn dispatch(&mut self, ready: &[Readiness]) {
        let mut closed = Vec::new();

        for readiness in ready {
            match readiness.token {
                LISTENER_TOKEN => acceptor::accept_connections(
                    &mut self.listener,
                    self.poll.registry(),
                    &mut self.connections,
                ),
                Token(conn_id) => {
                    if self.handle_connection_event(conn_id) {
                        closed.push(conn_id);
                    }
                }
            }
        }

        for conn_id in closed {
            self.close_connection(conn_id);
        }
    }

    /// Drive one connection. Returns true if it reached `Closed`.
    fn handle_connection_event(&mut self, conn_id: usize) -> bool {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return false;
        };

        if let Err(reason) = conn.drive() {
            log_close(conn_id, &reason);
            return true;
        }

        let Some(wanted) = conn.wanted_interest() else {
            return false;
        };
        if wanted == conn.registered_interest() {
            return false;
        }

        // Re-registering re-arms the edge, so readiness that is already
        // pending is reported on the next wait.
        match self
            .poll
            .registry()
            .reregister(conn.stream_mut(), Token(conn_id), wanted)
        {
            Ok(()) => {
                conn.set_registered_interest(wanted);
                false
            }
            Err(e) => {
                error!(conn_id, error = %e, "Failed to update interest");
                conn.close();
                true
            }
        }
    }

    /// Deregister and drop a connection; dropping closes the socket.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            debug!(conn_id, "Connection closed");
        }
    }

    /// Run until stopped or the poller fails.
    pub fn run(&mut self) -> Result<(), EventLoopError> {
        info!(
            addr = ?self.local_addr().ok(),
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            "Event loop started"
        );

        let result = self.run_until_stopped();
        if let Err(ref e) = result {
            error!(error = %e, "Event loop failed");
        }

        self.teardown();
        result
    }

    fn run_until_stopped(&mut self) -> Result<(), EventLoopError> {
        while !self.stop.is_stopped() {
            let ready = self.run_once(Some(self.poll_timeout))?;
            if !ready.is_empty() {
                self.dispatch(&ready);
            }
        }
        Ok(())
    }

    /// Close every remaining connection without draining it.
    fn teardown(&mut self) {
        let registry = self.poll.registry();
        let mut open = 0usize;
        for mut conn in self.connections.drain() {
            let _ = registry.deregister(conn.stream_mut());
            open += 1;
        }
        let _ = registry.deregister(&mut self.listener);

        info!(closed = open, "Event loop stopped");
    }
}

fn log_close(conn_id: usize, reason: &CloseReason) {
    match reason {
        CloseReason::PeerClosed => debug!(conn_id, "Peer closed connection"),
        CloseReason::UnexpectedEof { buffered } => {
            warn!(conn_id, buffered = *buffered, "Unexpected EOF")
        }
        CloseReason::Protocol(e) => warn!(conn_id, error = %e, "Protocol violation"),
        CloseReason::Io(e) => debug!(conn_id, error = %e, "Connection error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::acceptor::bind_listener;
    use crate::runtime::protocol::{read_frame, write_frame, ACKNOWLEDGEMENT};
    use std::io::Write;
    use std::time::Instant;

    const TICK: Option<Duration> = Some(Duration::from_millis(50));

    fn options() -> LoopOptions {
        LoopOptions {
            poll_timeout: Duration::from_millis(50),
            max_events: 64,
            max_connections: 16,
        }
    }

    fn new_loop(options: LoopOptions) -> EventLoop {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        EventLoop::new(listener, options).unwrap()
    }

    /// Poll and dispatch until `done` holds or two seconds pass.
    fn turn_until(event_loop: &mut EventLoop, mut done: impl FnMut(&EventLoop) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done(&*event_loop) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            let ready = event_loop.run_once(TICK).unwrap();
            event_loop.dispatch(&ready);
        }
    }

    #[test]
    fn test_run_once_times_out_empty() {
        let mut event_loop = new_loop(options());
        let started = Instant::now();
        let ready = event_loop.run_once(Some(Duration::from_millis(20))).unwrap();
        assert!(ready.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_listener_readiness_reported() {
        let mut event_loop = new_loop(options());
        let addr = event_loop.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let ready = event_loop.run_once(TICK).unwrap();
            if let Some(r) = ready.iter().find(|r| r.token == LISTENER_TOKEN) {
                assert!(r.readable);
                break;
            }
            assert!(Instant::now() < deadline);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_duplicate_registration_fails() {
        let event_loop = new_loop(options());
        let mut other = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();

        event_loop
            .register(&mut other, Token(7), Interest::READABLE)
            .unwrap();
        let err = event_loop
            .register(&mut other, Token(8), Interest::READABLE)
            .unwrap_err();
        assert_eq!(err.token, Token(8));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_listener_registered_by_new() {
        let mut event_loop = new_loop(options());
        let err = register(
            event_loop.poll.registry(),
            &mut event_loop.listener,
            Token(3),
            Interest::READABLE,
        )
        .unwrap_err();
        assert_eq!(err.token, Token(3));
        assert_eq!(err.to_string(), format!("failed to register Token(3): {}", err.source));
    }

    #[test]
    fn test_connection_lifecycle_in_table() {
        let mut event_loop = new_loop(options());
        let addr = event_loop.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        turn_until(&mut event_loop, |l| l.connection_count() == 1);

        write_frame(&mut client, b"hello").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let payload = loop {
            let ready = event_loop.run_once(TICK).unwrap();
            event_loop.dispatch(&ready);
            match read_frame(&mut client) {
                Ok(payload) => break payload,
                Err(_) => assert!(Instant::now() < deadline),
            }
        };
        assert_eq!(payload, ACKNOWLEDGEMENT);

        drop(client);
        turn_until(&mut event_loop, |l| l.connection_count() == 0);
    }

    #[test]
    fn test_oversize_request_removes_connection() {
        let mut event_loop = new_loop(options());
        let addr = event_loop.local_addr().unwrap();

        let mut bad = std::net::TcpStream::connect(addr).unwrap();
        let _good = std::net::TcpStream::connect(addr).unwrap();
        turn_until(&mut event_loop, |l| l.connection_count() == 2);

        bad.write_all(&300u32.to_ne_bytes()).unwrap();
        turn_until(&mut event_loop, |l| l.connection_count() == 1);
    }

    #[test]
    fn test_connection_limit() {
        let mut event_loop = new_loop(LoopOptions {
            max_connections: 1,
            ..options()
        });
        let addr = event_loop.local_addr().unwrap();

        let _first = std::net::TcpStream::connect(addr).unwrap();
        turn_until(&mut event_loop, |l| l.connection_count() == 1);

        let mut second = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..5 {
            let ready = event_loop.run_once(TICK).unwrap();
            event_loop.dispatch(&ready);
        }
        assert_eq!(event_loop.connection_count(), 1);

        // The rejected socket was closed by the server
        second
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 8];
        let n = std::io::Read::read(&mut second, &mut buf).unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_stop_ends_run() {
        let mut event_loop = new_loop(options());
        let addr = event_loop.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        event_loop.stop();
        event_loop.run().unwrap();
        assert_eq!(event_loop.connection_count(), 0);
    }
}
