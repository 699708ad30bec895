use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::WireStream;

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// TCP endpoint for workers.
///
/// Provides bind/accept on the worker side and connect on the client side.
/// Loopback is the expected deployment, but any reachable `host:port` works.
pub struct TcpEndpoint {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpEndpoint {
    /// Bind and listen on `host:port`. Port `0` lets the OS choose.
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let target = format!("{host}:{port}");
        let addr = resolve(&target)?;
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: target.clone(),
            source: e,
        })?;
        let addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: target,
            source: e,
        })?;

        info!(%addr, "listening on tcp endpoint");

        Ok(Self { listener, addr })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<WireStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        into_wire(stream)
    }

    /// Accept an incoming connection if one is pending.
    ///
    /// Switches the listener to non-blocking mode; returns `Ok(None)` when no
    /// connection is waiting. Accepted streams are always blocking.
    pub fn try_accept(&self) -> Result<Option<WireStream>> {
        self.listener
            .set_nonblocking(true)
            .map_err(TransportError::Accept)?;
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                stream.set_nonblocking(false)?;
                into_wire(stream).map(Some)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    /// Connect to a listening endpoint (blocking).
    pub fn connect(target: &str) -> Result<WireStream> {
        let addr = resolve(target)?;
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            addr: target.to_string(),
            source: e,
        })?;
        debug!(%addr, "connected to tcp endpoint");
        into_wire(stream)
    }

    /// Connect with an upper bound on the connection attempt.
    pub fn connect_timeout(target: &str, timeout: Duration) -> Result<WireStream> {
        let addr = resolve(target)?;
        let timeout = timeout.max(Duration::from_millis(1));
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| TransportError::Connect {
                addr: target.to_string(),
                source: e,
            })?;
        debug!(%addr, "connected to tcp endpoint");
        into_wire(stream)
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Resolve `host:port` to the first matching socket address.
pub fn resolve(target: &str) -> Result<SocketAddr> {
    target
        .to_socket_addrs()
        .map_err(|_| TransportError::InvalidAddress(target.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(target.to_string()))
}

fn into_wire(stream: TcpStream) -> Result<WireStream> {
    let stream = WireStream::from_tcp(stream);
    stream.set_nodelay(true)?;
    Ok(stream)
}
