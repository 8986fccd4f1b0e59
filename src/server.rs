//! Server bootstrap
//!
//! Owns the static configuration, the channel registry and the TLS acceptor.
//! `start` binds a listener and loops accepting connections; every accepted
//! socket gets its TLS handshake and client tasks on a spawned task so a
//! slow handshake never stalls the accept loop.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::client::Client;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::listener::KeepAliveListener;
use crate::registry::Registry;

/// The relay server.
///
/// Construction captures the configuration for the process lifetime; nothing
/// here is mutated after `start`. Multiple `start` calls on distinct
/// addresses share the registry and the ID counter.
pub struct RelayServer {
    config: RelayConfig,
    registry: Registry,
    tls: Option<TlsAcceptor>,
}

impl RelayServer {
    /// Build a server from its configuration and an optional TLS context.
    /// Starting without one fails with `NotTls`.
    pub fn new(config: RelayConfig, tls: Option<rustls::ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            tls: tls.map(|config| TlsAcceptor::from(Arc::new(config))),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind `addr` and serve it. Bind errors propagate to the caller. Clone
    /// the `Arc` to serve several addresses from one registry.
    pub async fn start(self: Arc<Self>, addr: &str) -> Result<(), RelayError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until the first
    /// accept error, which is returned.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        let acceptor = self.tls.clone().ok_or(RelayError::NotTls)?;
        let listener = KeepAliveListener::new(listener);
        info!(addr = %listener.local_addr()?, "server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        Client::spawn(tls_stream, peer, server);
                    }
                    Err(err) => debug!(%peer, %err, "TLS handshake failed"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::{
        duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
        WriteHalf,
    };
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    fn test_server(config: RelayConfig) -> Arc<RelayServer> {
        RelayServer::new(config, None)
    }

    fn raw_relay_config() -> RelayConfig {
        RelayConfig {
            send_origin: false,
            ..RelayConfig::default()
        }
    }

    /// The test side of one relay connection.
    struct Conn {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Conn {
        fn connect(server: &Arc<RelayServer>) -> Conn {
            let (local, remote) = duplex(64 * 1024);
            Client::spawn(remote, "127.0.0.1:9".parse().unwrap(), Arc::clone(server));
            let (reader, writer) = split(local);
            Conn {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        /// Next message, parsed. Panics if nothing arrives.
        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a message")
                .unwrap();
            assert!(n > 0, "unexpected end of stream");
            serde_json::from_str(&line).unwrap()
        }

        /// Raw next line, delimiter stripped.
        async fn recv_raw(&mut self) -> String {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a line")
                .unwrap();
            assert!(n > 0, "unexpected end of stream");
            line.trim_end().to_owned()
        }

        async fn recv_eof(&mut self) {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for close")
                .unwrap();
            assert_eq!(n, 0, "expected end of stream, got: {line}");
        }

        async fn assert_silent(&mut self) {
            let mut line = String::new();
            let result =
                timeout(Duration::from_millis(200), self.reader.read_line(&mut line)).await;
            assert!(result.is_err(), "expected silence, got: {line}");
        }

        async fn join(&mut self, channel: &str, role: &str) -> Value {
            self.send(&format!(
                r#"{{"type":"join","channel":"{channel}","connection_type":"{role}"}}"#
            ))
            .await;
            let joined = self.recv().await;
            assert_eq!(joined["type"], "channel_joined");
            assert_eq!(joined["channel"], channel);
            joined
        }
    }

    #[tokio::test]
    async fn test_handshake_error_closes_connection() {
        let server = test_server(RelayConfig::default());
        let mut conn = Conn::connect(&server);

        conn.send(r#"{"type":"bogus"}"#).await;
        let reply = conn.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "invalid_parameters");
        conn.recv_eof().await;
    }

    #[tokio::test]
    async fn test_malformed_json_closes_connection() {
        let server = test_server(RelayConfig::default());
        let mut conn = Conn::connect(&server);

        conn.send("this is not json").await;
        let reply = conn.recv().await;
        assert_eq!(reply["error"], "invalid_parameters");
        conn.recv_eof().await;
    }

    #[tokio::test]
    async fn test_join_with_empty_fields_rejected() {
        let server = test_server(RelayConfig::default());
        let mut conn = Conn::connect(&server);

        conn.send(r#"{"type":"join","channel":"","connection_type":"master"}"#)
            .await;
        let reply = conn.recv().await;
        assert_eq!(reply["error"], "invalid_parameters");
        conn.recv_eof().await;
    }

    #[tokio::test]
    async fn test_protocol_version_gate() {
        let server = test_server(RelayConfig::default());

        // A valid version does not advance the state; a join must follow.
        let mut conn = Conn::connect(&server);
        conn.send(r#"{"type":"protocol_version","version":2}"#).await;
        conn.join("room", "master").await;

        let mut bad = Conn::connect(&server);
        bad.send(r#"{"type":"protocol_version","version":0}"#).await;
        let reply = bad.recv().await;
        assert_eq!(reply["error"], "invalid_parameters");
        bad.recv_eof().await;
    }

    #[tokio::test]
    async fn test_key_mint_and_join() {
        let server = test_server(RelayConfig::default());

        let mut minter = Conn::connect(&server);
        minter.send(r#"{"type":"generate_key"}"#).await;
        let reply = minter.recv().await;
        assert_eq!(reply["type"], "generate_key");
        let key = reply["key"].as_str().unwrap().to_owned();
        assert_eq!(key.len(), 8);
        assert!(key.chars().all(|c| c.is_ascii_digit()));

        let mut joiner = Conn::connect(&server);
        joiner.join(&key, "master").await;
    }

    #[tokio::test]
    async fn test_asymmetric_relay() {
        let server = test_server(raw_relay_config());

        let mut a = Conn::connect(&server);
        let joined = a.join("room", "master").await;
        assert_eq!(joined["user_ids"], serde_json::json!([]));

        let mut b = Conn::connect(&server);
        let joined = b.join("room", "slave").await;
        assert_eq!(joined["user_ids"], serde_json::json!([1]));
        assert_eq!(joined["clients"][0]["connection_type"], "master");

        let notice = a.recv().await;
        assert_eq!(notice["type"], "client_joined");
        assert_eq!(notice["user_id"], 2);
        assert_eq!(notice["client"]["connection_type"], "slave");

        a.send(r#"{"type":"key","keyCode":97}"#).await;
        assert_eq!(b.recv_raw().await, r#"{"type":"key","keyCode":97}"#);
        a.assert_silent().await;
    }

    #[tokio::test]
    async fn test_relay_with_origin_injection() {
        let server = test_server(RelayConfig::default());

        let mut a = Conn::connect(&server);
        a.join("room", "master").await;
        let mut b = Conn::connect(&server);
        b.join("room", "slave").await;
        a.recv().await; // client_joined for B

        a.send(r#"{"type":"key","keyCode":97}"#).await;
        let received = b.recv().await;
        assert_eq!(received["type"], "key");
        assert_eq!(received["keyCode"], 97);
        assert_eq!(received["origin"], 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_relayed_without_origin() {
        let server = test_server(RelayConfig::default());

        let mut a = Conn::connect(&server);
        a.join("room", "master").await;
        let mut b = Conn::connect(&server);
        b.join("room", "slave").await;
        a.recv().await; // client_joined for B

        a.send("not json at all").await;
        assert_eq!(b.recv_raw().await, "not json at all");
    }

    #[tokio::test]
    async fn test_controller_without_peer_reported() {
        let server = test_server(RelayConfig::default());

        let mut a = Conn::connect(&server);
        a.join("room", "master").await;

        a.send(r#"{"type":"key"}"#).await;
        let reply = a.recv().await;
        assert_eq!(reply["type"], "nvda_not_connected");
    }

    #[tokio::test]
    async fn test_same_role_peers_are_invisible() {
        let server = test_server(RelayConfig::default());

        let mut a = Conn::connect(&server);
        a.join("room", "master").await;
        let mut a2 = Conn::connect(&server);
        a2.join("room", "master").await;

        // Same role: no join notice either.
        a.assert_silent().await;

        a.send(r#"{"type":"ping"}"#).await;
        let reply = a.recv().await;
        assert_eq!(reply["type"], "nvda_not_connected");
        a2.assert_silent().await;
    }

    #[tokio::test]
    async fn test_channel_lifecycle() {
        let server = test_server(RelayConfig::default());

        let mut a = Conn::connect(&server);
        a.join("room", "master").await;
        let mut b = Conn::connect(&server);
        b.join("room", "slave").await;
        a.recv().await; // client_joined for B

        drop(a);
        let notice = b.recv().await;
        assert_eq!(notice["type"], "client_left");
        assert_eq!(notice["user_id"], 1);

        drop(b);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while server.registry().channel_count().await != 0 {
            assert!(tokio::time::Instant::now() < deadline, "channel not torn down");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_motd_sent_after_join() {
        let server = test_server(RelayConfig {
            motd: "scheduled maintenance at noon".into(),
            motd_force_display: true,
            send_origin: true,
        });

        let mut a = Conn::connect(&server);
        a.join("room", "master").await;
        let motd = a.recv().await;
        assert_eq!(motd["type"], "motd");
        assert_eq!(motd["motd"], "scheduled maintenance at noon");
        assert_eq!(motd["force_display"], true);
    }

    #[tokio::test]
    async fn test_serve_without_tls_fails() {
        let server = test_server(RelayConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(listener).await,
            Err(RelayError::NotTls)
        ));
    }

    #[tokio::test]
    async fn test_tls_round_trip() {
        use rustls::pki_types::ServerName;
        use tokio_rustls::TlsConnector;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pem");
        let tls = crate::tls::generate(Some(&path)).unwrap();

        let server = RelayServer::new(RelayConfig::default(), Some(tls));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                let _ = server.serve(listener).await;
            }
        });

        // Trust the generated certificate.
        let pem = std::fs::read(&path).unwrap();
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            roots.add(cert.unwrap()).unwrap();
        }
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let stream = connector.connect(name, tcp).await.unwrap();

        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);
        writer.write_all(b"{\"type\":\"bogus\"}\n").await.unwrap();

        let mut line = String::new();
        timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["error"], "invalid_parameters");

        line.clear();
        let n = timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "expected the server to close the connection");
    }
}
