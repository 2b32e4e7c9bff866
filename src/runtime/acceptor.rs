//! Listening socket setup and connection acceptance.

use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::event_loop::{register, LISTENER_TOKEN};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, error, warn};

/// Create a non-blocking TCP listener bound to `addr`.
///
/// The backlog is the platform maximum.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Accept every pending connection on `listener`.
///
/// mio readiness is edge-triggered, so this keeps accepting until
/// `WouldBlock`; stopping early would strand the rest of the backlog until
/// another client arrives. When accept fails outright (`EMFILE`, `ENFILE`)
/// the listener is re-armed instead, so the next wait reports it again.
/// Failures are logged and never reach the caller.
pub fn accept_connections(
    listener: &mut TcpListener,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => admit(stream, peer, registry, connections),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                debug!(error = %e, "Transient accept failure");
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                let rearm = registry.reregister(listener, LISTENER_TOKEN, Interest::READABLE);
                if let Err(e) = rearm {
                    error!(error = %e, "Failed to re-arm listener");
                }
                break;
            }
        }
    }
}

/// Register an accepted stream and add it to the table.
fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Registry,
    connections: &mut ConnectionRegistry<TcpStream>,
) {
    // Accepted mio streams are already non-blocking.
    let conn_id = match connections.insert(Connection::new(stream)) {
        Some(id) => id,
        None => {
            warn!(peer = %peer, "Connection limit reached, rejecting connection");
            return;
        }
    };

    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };
    if let Err(e) = register(registry, conn.stream_mut(), Token(conn_id), Interest::READABLE) {
        error!(conn_id, peer = %peer, error = %e, "Failed to register connection");
        connections.remove(conn_id);
        return;
    }
    conn.set_registered_interest(Interest::READABLE);

    debug!(conn_id, peer = %peer, "Accepted connection");
}
