//! Keep-alive listener wrapper
//!
//! Accepts TCP connections and enables OS keep-alives before the TLS layer
//! sees them. Keep-alive is a liveness hint, not a correctness requirement,
//! so a failure to set it is tolerated.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Keep-alive probe period applied to every accepted connection.
pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(15);

/// A `TcpListener` whose accepted sockets have TCP keep-alive enabled.
pub struct KeepAliveListener {
    inner: TcpListener,
}

impl KeepAliveListener {
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept the next connection. Accept errors propagate unchanged.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        let keepalive = TcpKeepalive::new().with_time(KEEP_ALIVE_PERIOD);
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(%peer, %err, "failed to enable TCP keep-alive");
        }
        Ok((stream, peer))
    }
}
