//! Connection state machine.
//!
//! A connection alternates between reading one request and writing its
//! response:
//!
//! ```text
//!            frame decoded                 response drained
//! AwaitingRequest ──────────▶ SendingResponse ──────────▶ AwaitingRequest
//!        │                          │
//!        └──── EOF / error ─────────┴──────────▶ Closed
//! ```
//!
//! Sockets are edge-triggered, so [`Connection::drive`] keeps going until the
//! socket reports `WouldBlock` or the connection ends. Frames already resident
//! in the read buffer are processed before reading again, otherwise a
//! pipelined request would sit there with no further readiness to wake it.

use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use crate::runtime::protocol::{self, FrameError, ProcessResult, HEADER_LEN};
use mio::Interest;
use slab::Slab;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading until a complete request frame is buffered.
    AwaitingRequest,
    /// A response frame is queued in the write buffer.
    SendingResponse,
    /// Terminal. No more I/O happens on the socket.
    Closed,
}

/// Why a connection reached [`ConnState::Closed`].
#[derive(Debug, Error)]
pub enum CloseReason {
    /// Peer closed between frames.
    #[error("peer closed the connection")]
    PeerClosed,
    /// Peer closed in the middle of a frame.
    #[error("unexpected EOF with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },
    /// Peer broke the framing rules.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),
    /// Read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    /// Interest currently registered with the poller.
    registered: Interest,
}

impl<S> Connection<S> {
    /// Create a connection awaiting its first request.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnState::AwaitingRequest,
            read_buf: ReadBuffer::new(),
            write_buf: WriteBuffer::new(),
            registered: Interest::READABLE,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes buffered towards the next request.
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Response bytes queued and not yet written.
    pub fn pending_response(&self) -> usize {
        self.write_buf.pending().len()
    }

    /// Interest the socket should be registered with for the current state.
    pub fn wanted_interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::AwaitingRequest => Some(Interest::READABLE),
            ConnState::SendingResponse => Some(Interest::WRITABLE),
            ConnState::Closed => None,
        }
    }

    pub fn registered_interest(&self) -> Interest {
        self.registered
    }

    pub fn set_registered_interest(&mut self, interest: Interest) {
        self.registered = interest;
    }

    /// Mark the connection closed.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    /// Extract one request from the read buffer and queue its response.
    ///
    /// Returns `Ok(true)` if a response was queued. Touches only buffers, so
    /// it never blocks.
    fn try_one_request(&mut self) -> Result<bool, FrameError> {
        debug_assert!(self.write_buf.is_empty());

        match protocol::process_request(self.read_buf.filled(), self.write_buf.frame_mut())? {
            ProcessResult::NeedData => Ok(false),
            ProcessResult::Response {
                consumed,
                payload_len,
                response_len,
            } => {
                let payload = &self.read_buf.filled()[HEADER_LEN..consumed];
                trace!(
                    payload_len,
                    payload = %String::from_utf8_lossy(payload),
                    "Request received"
                );

                self.read_buf.consume(consumed);
                self.write_buf.queue(response_len);
                self.state = ConnState::SendingResponse;
                Ok(true)
            }
        }
    }
}

impl<S: Read + Write> Connection<S> {
    /// Run the state machine until the socket would block or the connection
    /// ends.
    ///
    /// Returns `Err` exactly once, on the transition to `Closed`. Driving a
    /// closed connection does nothing.
    pub fn drive(&mut self) -> Result<(), CloseReason> {
        loop {
            let step = match self.state {
                ConnState::AwaitingRequest => self.on_awaiting_request(),
                ConnState::SendingResponse => self.flush(),
                ConnState::Closed => return Ok(()),
            };

            match step {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(reason) => {
                    self.close();
                    return Err(reason);
                }
            }
        }
    }

    /// One step of request handling. `Ok(true)` means progress was made.
    fn on_awaiting_request(&mut self) -> Result<bool, CloseReason> {
        if self.try_one_request()? {
            return Ok(true);
        }
        self.fill()
    }

    /// Read once into the spare capacity of the read buffer.
    ///
    /// `Ok(false)` means the socket is drained for now.
    fn fill(&mut self) -> Result<bool, CloseReason> {
        // A partial frame always leaves room: it is shorter than MAX_FRAME.
        debug_assert!(self.read_buf.len() < self.read_buf.capacity());

        loop {
            match self.stream.read(self.read_buf.spare_mut()) {
                Ok(0) => {
                    return Err(if self.read_buf.is_empty() {
                        CloseReason::PeerClosed
                    } else {
                        CloseReason::UnexpectedEof {
                            buffered: self.read_buf.len(),
                        }
                    });
                }
                Ok(n) => {
                    self.read_buf.commit(n);
                    return Ok(true);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
    }

    /// Write the queued response.
    ///
    /// `Ok(true)` means it drained and the connection is awaiting the next
    /// request; `Ok(false)` means the socket would block with data still
    /// queued.
    fn flush(&mut self) -> Result<bool, CloseReason> {
        while !self.write_buf.is_drained() {
            match self.stream.write(self.write_buf.pending()) {
                Ok(0) => {
                    return Err(CloseReason::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(
                        sent = self.write_buf.sent(),
                        len = self.write_buf.len(),
                        "Response write would block"
                    );
                    return Ok(false);
                }
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }

        trace!(len = self.write_buf.len(), "Response sent");
        self.write_buf.reset();
        self.state = ConnState::AwaitingRequest;
        Ok(true)
    }
}

/// Table of live connections using slab allocation.
///
/// The slab key doubles as the poll token, so each registered socket maps to
/// at most one entry.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.connections.drain()
    }
}
