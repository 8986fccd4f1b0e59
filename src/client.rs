//! Per-client connection handler
//!
//! Each connection runs two tasks: a reader that drives the handshake state
//! machine and dispatches post-join traffic, and the write pump worker (see
//! `writer`). The client itself is shared between them, the channel registry
//! and the server through an `Arc`; the registry never closes a client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, trace};

use crate::message::{ClientInfo, HandshakeMessage, Msg, ServerMessage, DELIMITER};
use crate::server::RelayServer;
use crate::types::ClientId;
use crate::writer::{self, ClientWriter, WRITE_QUEUE_SIZE};

/// Size of the buffered reader over the socket. A line longer than this is
/// delivered in chunks rather than rejected.
pub const READ_BUF_SIZE: usize = 64 * 1024;

/// A connected client.
///
/// The ID stays 0 until a channel is joined; channel name and role are set
/// exactly once; the `closed` flag moves monotonically false→true and doubles
/// as the single-shot close latch.
pub struct Client {
    remote_addr: SocketAddr,
    id: AtomicU64,
    channel: OnceLock<String>,
    connection_type: OnceLock<String>,
    version: AtomicI64,
    connected_at: Instant,
    closed: AtomicBool,
    shutdown: Notify,
    write_duration_ns: AtomicU64,
    writer: ClientWriter,
    server: Arc<RelayServer>,
}

impl Client {
    /// Wire up a freshly accepted connection: split the stream, start the
    /// write pump and the reader task, and hand back the shared client.
    pub fn spawn<S>(stream: S, remote_addr: SocketAddr, server: Arc<RelayServer>) -> Arc<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = io::split(stream);
        let (queue_tx, queue_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (done_tx, done_rx) = oneshot::channel();

        let client = Arc::new(Client {
            remote_addr,
            id: AtomicU64::new(0),
            channel: OnceLock::new(),
            connection_type: OnceLock::new(),
            version: AtomicI64::new(0),
            connected_at: Instant::now(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            write_duration_ns: AtomicU64::new(0),
            writer: ClientWriter::new(queue_tx, done_rx),
            server,
        });
        info!(client = %client.label(), "client connected");

        tokio::spawn(writer::run(
            Arc::clone(&client),
            write_half,
            queue_rx,
            done_tx,
        ));
        tokio::spawn(supervise(Arc::clone(&client), read_half));
        client
    }

    /// Close the client: single-shot. Unblocks the reader, removes the
    /// client from its channel (peers get their `client_left` before this
    /// socket goes away), then closes the write pump, which shuts the
    /// socket down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        if self.channel.get().is_some() {
            self.server.registry().remove_client(self).await;
        }
        self.writer.close().await;
        info!(
            client = %self.label(),
            longest_write = ?self.write_duration(),
            connected_for = ?self.connected_at.elapsed(),
            "client disconnected"
        );
    }

    /// Encode a server message and queue it for this client.
    pub(crate) async fn send_msg(&self, msg: ServerMessage) {
        match msg.to_line() {
            Ok(line) => self.send_line(line).await,
            Err(err) => error!(client = %self.label(), %err, "failed to encode message"),
        }
    }

    /// Queue a raw line; a failed enqueue means the pump is gone, so the
    /// client is torn down.
    pub(crate) async fn send_line(&self, line: Vec<u8>) {
        if self.writer.enqueue(line).await.is_err() {
            Box::pin(self.close()).await;
        }
    }

    /// Queue a raw line without teardown on failure. The registry fan-out
    /// uses this under its read lock, where escalating into a close (and its
    /// write-locked removal) would deadlock.
    pub(crate) async fn enqueue_line(&self, line: Vec<u8>) -> Result<(), crate::RelayError> {
        self.writer.enqueue(line).await
    }

    /// Identity payload for join/leave notifications.
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id(),
            connection_type: self.connection_type().to_owned(),
        }
    }

    pub fn id(&self) -> ClientId {
        ClientId(self.id.load(Ordering::Relaxed))
    }

    pub(crate) fn assign_id(&self, id: ClientId) {
        self.id.store(id.0, Ordering::Relaxed);
    }

    /// The joined channel name, if any. Never reassigned once set.
    pub fn channel(&self) -> Option<&str> {
        self.channel.get().map(String::as_str)
    }

    /// The declared role; empty before a join.
    pub fn connection_type(&self) -> &str {
        self.connection_type.get().map(String::as_str).unwrap_or("")
    }

    /// The declared protocol version, if a valid one was announced.
    pub fn protocol_version(&self) -> Option<i64> {
        match self.version.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Longest single write observed for this client.
    pub fn write_duration(&self) -> Duration {
        Duration::from_nanos(self.write_duration_ns.load(Ordering::Relaxed))
    }

    pub(crate) fn store_write_duration(&self, elapsed: Duration) {
        if self.is_closed() {
            return;
        }
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        let previous = self.write_duration_ns.fetch_max(nanos, Ordering::Relaxed);
        if nanos > previous {
            debug!(client = %self.label(), duration = ?elapsed, "longest write so far");
        }
    }

    /// Log label: the assigned ID once joined, the remote address before.
    pub(crate) fn label(&self) -> String {
        match self.id.load(Ordering::Relaxed) {
            0 => self.remote_addr.to_string(),
            id => id.to_string(),
        }
    }

    async fn handle_handshake(self: &Arc<Self>, line: &[u8]) -> bool {
        let handshake: HandshakeMessage = match serde_json::from_slice(line) {
            Ok(handshake) => handshake,
            Err(err) => {
                debug!(
                    client = %self.label(),
                    %err,
                    data = %String::from_utf8_lossy(truncate(line, 12)),
                    "invalid handshake"
                );
                self.send_msg(ServerMessage::invalid_parameters()).await;
                return false;
            }
        };
        match handshake {
            HandshakeMessage::ProtocolVersion { version } => {
                if version <= 0 {
                    debug!(client = %self.label(), version, "invalid protocol version");
                    self.send_msg(ServerMessage::invalid_parameters()).await;
                    return false;
                }
                debug!(client = %self.label(), version, "protocol version announced");
                self.version.store(version, Ordering::Relaxed);
                true
            }
            HandshakeMessage::GenerateKey => {
                let key = self.server.registry().generate_key().await;
                debug!(client = %self.label(), key = %key, "channel key generated");
                self.send_msg(ServerMessage::GenerateKey { key }).await;
                true
            }
            HandshakeMessage::Join {
                channel,
                connection_type,
            } => {
                if channel.is_empty() || connection_type.is_empty() {
                    debug!(client = %self.label(), "join with empty channel or connection type");
                    self.send_msg(ServerMessage::invalid_parameters()).await;
                    return false;
                }
                let _ = self.channel.set(channel);
                let _ = self.connection_type.set(connection_type);
                self.server.registry().add_client(Arc::clone(self)).await;
                self.send_motd().await;
                true
            }
        }
    }

    /// Forward one post-join line to the channel. With origin injection on,
    /// decodable JSON objects get an `origin` stamp; everything else is
    /// relayed verbatim.
    async fn relay(&self, line: &[u8]) {
        let registry = self.server.registry();
        if !self.server.config().send_origin {
            registry.send_line_to_channel(self, line, true).await;
            return;
        }
        match serde_json::from_slice::<Msg>(line) {
            Ok(msg) => registry.send_msg_to_channel(self, msg, true).await,
            Err(err) => {
                debug!(client = %self.label(), %err, "relaying undecodable payload without origin");
                registry.send_line_to_channel(self, line, true).await;
            }
        }
    }

    async fn send_motd(&self) {
        let config = self.server.config();
        if config.motd.is_empty() {
            return;
        }
        self.send_msg(ServerMessage::Motd {
            motd: config.motd.clone(),
            force_display: config.motd_force_display,
        })
        .await;
    }
}

#[cfg(test)]
impl Client {
    /// Set channel and role directly, standing in for a wire handshake.
    pub(crate) fn set_membership(&self, channel: &str, role: &str) {
        let _ = self.channel.set(channel.to_owned());
        let _ = self.connection_type.set(role.to_owned());
    }
}

/// Run the reader, containing any panic to this client, then close.
async fn supervise<S>(client: Arc<Client>, read_half: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let reader = tokio::spawn(read_loop(Arc::clone(&client), read_half));
    if let Err(err) = reader.await {
        if err.is_panic() {
            error!(client = %client.label(), %err, "panic in connection handler");
        }
    }
    client.close().await;
}

async fn read_loop<S>(client: Arc<Client>, read_half: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut reader = BufReader::with_capacity(READ_BUF_SIZE, read_half);
    debug!(client = %client.label(), size = READ_BUF_SIZE, "read buffer created");
    let mut line = Vec::new();
    loop {
        if client.is_closed() {
            return;
        }
        tokio::select! {
            _ = client.shutdown.notified() => return,
            read = read_delimited(&mut reader, &mut line) => match read {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    if !client.is_closed() {
                        error!(client = %client.label(), %err, "read error");
                    }
                    return;
                }
            },
        }
        trace!(
            client = %client.label(),
            payload = %String::from_utf8_lossy(&line),
            "received line"
        );
        if client.channel.get().is_some() {
            client.relay(&line).await;
            continue;
        }
        if !client.handle_handshake(&line).await {
            return;
        }
    }
}

/// Read one delimited line, including the delimiter, into `line`.
///
/// A line longer than `READ_BUF_SIZE` is returned as a partial chunk without
/// its delimiter and reading continues from where it left off. Returns
/// `Ok(0)` on end of stream; a partial line cut off by EOF dies with the
/// connection.
async fn read_delimited<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    loop {
        let consumed = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(0);
            }
            let room = READ_BUF_SIZE - line.len();
            match available.iter().position(|&b| b == DELIMITER) {
                Some(pos) if pos < room => {
                    line.extend_from_slice(&available[..=pos]);
                    pos + 1
                }
                _ => {
                    let take = available.len().min(room);
                    line.extend_from_slice(&available[..take]);
                    take
                }
            }
        };
        reader.consume(consumed);
        if line.last() == Some(&DELIMITER) || line.len() >= READ_BUF_SIZE {
            return Ok(line.len());
        }
    }
}

fn truncate(data: &[u8], n: usize) -> &[u8] {
    &data[..data.len().min(n)]
}
