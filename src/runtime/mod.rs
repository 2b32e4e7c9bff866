//! Single-threaded readiness runtime.
//!
//! - `protocol`: length-prefixed framing and the acknowledgement response
//! - `buffer`: fixed-size per-connection read/write buffers
//! - `connection`: connection state machine and the connection table
//! - `acceptor`: listener setup and the accept loop
//! - `event_loop`: the poll/dispatch cycle that ties them together

mod acceptor;
mod buffer;
mod connection;
mod event_loop;
pub mod protocol;

pub use acceptor::bind_listener;
pub use connection::{CloseReason, ConnState, Connection, ConnectionRegistry};
pub use event_loop::{
    EventLoop, EventLoopError, LoopOptions, Readiness, RegistrationError, StopHandle,
};

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use tracing::info;

/// A bound server whose event loop has not started yet.
pub struct Server {
    event_loop: EventLoop,
}

impl Server {
    /// Bind the listening socket and set up the event loop.
    pub fn bind(config: &Config) -> Result<Self, EventLoopError> {
        let listener = bind_listener(config.listen).map_err(|source| EventLoopError::Bind {
            addr: config.listen,
            source,
        })?;

        let event_loop = EventLoop::new(
            listener,
            LoopOptions {
                poll_timeout: config.poll_timeout,
                max_events: config.max_events,
                max_connections: config.max_connections,
            },
        )?;

        info!(
            addr = ?event_loop.local_addr().ok(),
            max_connections = config.max_connections,
            "Server listening"
        );

        Ok(Self { event_loop })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.event_loop.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    /// Run the event loop on the calling thread until stopped.
    pub fn run(mut self) -> Result<(), EventLoopError> {
        self.event_loop.run()
    }

    /// Run the event loop on a dedicated `event-loop` thread.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let addr = self.local_addr()?;
        let stop = self.stop_handle();

        let thread = thread::Builder::new()
            .name("event-loop".to_string())
            .spawn(move || self.run())?;

        Ok(ServerHandle { addr, stop, thread })
    }
}

/// Handle to a server running on its own thread.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: StopHandle,
    thread: JoinHandle<Result<(), EventLoopError>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Ask the event loop to stop at its next iteration boundary.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the event loop thread to finish.
    pub fn join(self) -> Result<(), EventLoopError> {
        self.thread.join().map_err(|_| EventLoopError::Panicked)?
    }

    /// Stop the event loop and wait for it.
    pub fn shutdown(self) -> Result<(), EventLoopError> {
        self.stop();
        self.join()
    }
}

/// Bind and serve until the event loop stops.
pub fn run(config: &Config) -> Result<(), EventLoopError> {
    let server = Server::bind(config)?;
    let handle = server.spawn().map_err(EventLoopError::Spawn)?;
    handle.join()
}
