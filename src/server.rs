//! TCP server and per-connection loop.
//!
//! The [`ServerBuilder`] provides a fluent API for configuring the gateway.
//! The [`RelpServer`] manages the lifecycle:
//! 1. Bind the TCP listener
//! 2. Accept connections, bounded by `max_connections`
//! 3. Run one [`RelpSession`] per connection in its own task
//! 4. Hand decoded messages to the [`MessageSink`], acknowledge what it stored
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relp_gateway::server::RelpServer;
//! use relp_gateway::sink::JsonLinesSink;
//!
//! #[tokio::main]
//! async fn main() -> relp_gateway::Result<()> {
//!     let sink = Arc::new(JsonLinesSink::open("messages.jsonl")?);
//!     let server = RelpServer::builder()
//!         .bind_addr("127.0.0.1:2514")
//!         .max_connections(64)
//!         .bind(sink)
//!         .await?;
//!
//!     server.run().await
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{RelpError, Result};
use crate::session::{RelpSession, SessionConfig};
use crate::sink::MessageSink;

/// Default listen address (the IANA-registered RELP port).
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2514";

/// Default size of a single socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Gateway configuration.
///
/// Every field has a default, so a JSON config only needs the fields it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: String,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
    /// Drop a connection after this long without inbound bytes; 0 disables.
    pub idle_timeout_ms: u64,
    /// Connections beyond this limit are refused.
    pub max_connections: usize,
    /// Settings for each session.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            idle_timeout_ms: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Builder for configuring and binding a [`RelpServer`].
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Set the listen address.
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Set the per-read buffer size.
    ///
    /// Default: 2048
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the idle timeout. `Duration::ZERO` disables it.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the maximum number of concurrent connections.
    ///
    /// Default: 256
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.config.max_connections = limit;
        self
    }

    /// Set the `relp_software` value announced to clients.
    pub fn software(mut self, software: impl Into<String>) -> Self {
        self.config.session.software = software.into();
        self
    }

    /// Lower the per-frame datalen cap.
    pub fn max_datalen(mut self, max_datalen: usize) -> Self {
        self.config.session.max_datalen = max_datalen;
        self
    }

    /// Finish without binding.
    pub fn build(self) -> ServerConfig {
        self.config
    }

    /// Bind the listener.
    pub async fn bind(self, sink: Arc<dyn MessageSink>) -> Result<RelpServer> {
        RelpServer::bind(self.config, sink).await
    }
}

/// A bound RELP gateway.
pub struct RelpServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    sink: Arc<dyn MessageSink>,
    connections: Arc<Semaphore>,
}

impl RelpServer {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind to `config.bind_addr`.
    pub async fn bind(config: ServerConfig, sink: Arc<dyn MessageSink>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "RELP gateway listening");

        Ok(Self {
            listener,
            connections: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            sink,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The configuration in use.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections forever.
    ///
    /// A failed `accept` (e.g. out of file descriptors) is logged and
    /// retried after a short pause.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = next_connection(|| self.listener.accept()).await;

            let permit = match self.connections.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    warn!(%peer, "connection limit reached, refusing connection");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "could not set TCP_NODELAY");
            }

            let sink = self.sink.clone();
            let config = self.config.clone();
            let span = tracing::info_span!("relp_connection", %peer);

            tokio::spawn(
                async move {
                    // Permit is held until the connection ends
                    let _permit = permit;

                    match serve_connection(stream, sink, &config).await {
                        Ok(()) => debug!("connection finished"),
                        Err(RelpError::ConnectionClosed) => {
                            info!("peer disconnected without close")
                        }
                        Err(e) => error!(error = %e, "connection terminated"),
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Await `accept` until it succeeds, backing off after each failure.
async fn next_connection<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Drive one RELP session over `stream` until it closes.
///
/// Reads inbound bytes into a fresh [`RelpSession`], stores decoded messages
/// through `sink` on a blocking thread, acknowledges each stored message and
/// writes queued response frames in order. Returns `Ok(())` after the
/// response to `close` has been written.
///
/// # Errors
///
/// - [`RelpError::ConnectionClosed`] if the peer disconnects before `close`
/// - any session error (the connection cannot continue after one)
/// - I/O, storage or idle-timeout failures
pub async fn serve_connection<S>(
    mut stream: S,
    sink: Arc<dyn MessageSink>,
    config: &ServerConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = RelpSession::with_config(config.session.clone());
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    loop {
        let read = stream.read(&mut buf);
        let n = match config.idle_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(RelpError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no data for {:?}", timeout),
                    )))
                }
            },
            None => read.await?,
        };

        if n == 0 {
            return Err(RelpError::ConnectionClosed);
        }

        session.on_client_data(&buf[..n])?;
        deliver_messages(&mut session, &sink).await?;
        flush_outbound(&mut session, &mut stream).await?;

        if session.is_closed() {
            if session.buffered_len() > 0 {
                debug!(
                    bytes = session.buffered_len(),
                    "discarding partial frame received after close"
                );
            }
            stream.shutdown().await?;
            return Ok(());
        }
    }
}

/// Store pending messages and queue their acknowledgements.
async fn deliver_messages(session: &mut RelpSession, sink: &Arc<dyn MessageSink>) -> Result<()> {
    let batch = session.drain_messages();
    if batch.is_empty() {
        return Ok(());
    }

    let sink = Arc::clone(sink);
    let stored = tokio::task::spawn_blocking(move || sink.store(&batch).map(|()| batch))
        .await
        .map_err(|e| RelpError::Storage(format!("storage task failed: {}", e)))??;

    for message in &stored {
        session.ack_msg(message.txid);
    }
    Ok(())
}

/// Write every queued response frame, oldest first.
async fn flush_outbound<W>(session: &mut RelpSession, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frames = session.drain_outbound();
    if frames.is_empty() {
        return Ok(());
    }

    for frame in &frames {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RelpMessage;
    use crate::sink::MemorySink;
    use tokio::io::duplex;

    const OPEN: &[u8] = b"1 open 14 relp_version=0\n";

    struct FailingSink;

    impl MessageSink for FailingSink {
        fn store(&self, _batch: &[RelpMessage]) -> Result<()> {
            Err(RelpError::Storage("disk full".to_string()))
        }
    }

    async fn read_all<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = ServerConfig::from_json_str(
            r#"{"bind_addr": "127.0.0.1:10514", "idle_timeout_ms": 500, "session": {"software": "journalmon"}}"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:10514");
        assert_eq!(config.idle_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.session.software, "journalmon");
        assert_eq!(config.session.max_datalen, crate::protocol::MAX_DATALEN);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{"max_connections": 8}"#).unwrap();

        let config = ServerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn test_config_invalid_json() {
        let err = ServerConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, RelpError::Json(_)));
    }

    #[test]
    fn test_builder_configuration() {
        let config = RelpServer::builder()
            .bind_addr("127.0.0.1:0")
            .read_buffer_size(512)
            .idle_timeout(Duration::from_secs(30))
            .max_connections(4)
            .software("journalmon")
            .max_datalen(1024)
            .build();

        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert_eq!(config.read_buffer_size, 512);
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.session.software, "journalmon");
        assert_eq!(config.session.max_datalen, 1024);
    }

    #[test]
    fn test_builder_idle_timeout_saturates() {
        let config = RelpServer::builder().idle_timeout(Duration::MAX).build();
        assert_eq!(config.idle_timeout_ms, u64::MAX);

        let config = RelpServer::builder().idle_timeout(Duration::ZERO).build();
        assert_eq!(config.idle_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_are_retried() {
        let mut attempts = 0u32;

        let accepted = next_connection(|| {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "aborted",
                    ))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(accepted, 3);
    }

    #[tokio::test]
    async fn test_close_with_trailing_partial_frame() {
        let (mut client, server) = duplex(4096);
        let sink: Arc<dyn MessageSink> = Arc::new(MemorySink::new());
        let config = ServerConfig::default();

        let task = tokio::spawn(async move { serve_connection(server, sink, &config).await });

        let open_rsp_len = b"1 rsp 57 relp_version=0\nrelp_software=relp-gateway\ncommands=syslog\n".len();
        client.write_all(OPEN).await.unwrap();
        let mut open_rsp = vec![0u8; open_rsp_len];
        client.read_exact(&mut open_rsp).await.unwrap();

        client.write_all(b"2 close 0\n3 sys").await.unwrap();
        let response = read_all(&mut client).await;

        task.await.unwrap().unwrap();
        assert_eq!(response, b"2 rsp 0\n");
    }

    #[tokio::test]
    async fn test_serve_connection_full_session() {
        let (mut client, server) = duplex(4096);
        let sink = Arc::new(MemorySink::new());
        let config = ServerConfig::default();

        let task = {
            let sink: Arc<dyn MessageSink> = sink.clone();
            tokio::spawn(async move { serve_connection(server, sink, &config).await })
        };

        client.write_all(OPEN).await.unwrap();
        client.write_all(b"2 syslog 6 foobar\n").await.unwrap();

        let expected = b"1 rsp 57 relp_version=0\nrelp_software=relp-gateway\ncommands=syslog\n2 rsp 6 200 OK\n";
        let mut response = vec![0u8; expected.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..], &expected[..]);

        client.write_all(b"3 close 0\n").await.unwrap();
        let response = read_all(&mut client).await;
        task.await.unwrap().unwrap();

        assert_eq!(response, b"3 rsp 0\n");
        assert_eq!(sink.messages(), vec![RelpMessage::new(2, &b"foobar"[..])]);
    }

    #[tokio::test]
    async fn test_serve_connection_peer_disconnect() {
        let (mut client, server) = duplex(4096);
        let sink: Arc<dyn MessageSink> = Arc::new(MemorySink::new());
        let config = ServerConfig::default();

        let task = tokio::spawn(async move { serve_connection(server, sink, &config).await });

        client.write_all(&OPEN[..10]).await.unwrap();
        drop(client);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RelpError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_serve_connection_protocol_error() {
        let (mut client, server) = duplex(4096);
        let sink: Arc<dyn MessageSink> = Arc::new(MemorySink::new());
        let config = ServerConfig::default();

        let task = tokio::spawn(async move { serve_connection(server, sink, &config).await });

        client.write_all(b"1 syslog 3 abc\n").await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_storage_failure_is_not_acknowledged() {
        let (mut client, server) = duplex(4096);
        let sink: Arc<dyn MessageSink> = Arc::new(FailingSink);
        let config = ServerConfig::default();

        let task = tokio::spawn(async move { serve_connection(server, sink, &config).await });

        client.write_all(OPEN).await.unwrap();
        client.write_all(b"2 syslog 6 foobar\n").await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RelpError::Storage(_)));

        let response = read_all(&mut client).await;
        assert!(!String::from_utf8_lossy(&response).contains("200 OK"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_client, server) = duplex(4096);
        let sink: Arc<dyn MessageSink> = Arc::new(MemorySink::new());
        let config = RelpServer::builder()
            .idle_timeout(Duration::from_millis(100))
            .build();

        let err = serve_connection(server, sink, &config).await.unwrap_err();

        match err {
            RelpError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {}", other),
        }
    }
}
