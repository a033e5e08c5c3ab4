//! Plain TCP transport for equipment controlled through a raw socket,
//! such as robot controllers listening on a script port.

use crate::endpoint::{Binding, ConnectionState, Endpoint};
use crate::error::{FaultKind, FaultOrigin, FaultResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Span};

/// Default bound on establishing the connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP endpoint.
pub struct SocketInterface {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    origin: FaultOrigin,
    binding: Binding<BufReader<TcpStream>>,
    span: Span,
}

impl SocketInterface {
    /// Interface on `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let span = info_span!("socket", host = %host, port);
        Self {
            host,
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Duration::from_secs(1),
            origin: FaultOrigin::new("SocketInterface"),
            binding: Binding::new(),
            span,
        }
    }

    /// Bound on establishing the connection.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Bound on each read.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Replace the tracing span this interface logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read one `\n`-terminated line, without the terminator.
    pub async fn read_line(&mut self) -> FaultResult<String> {
        let read_timeout = self.read_timeout;
        let origin = self.origin.clone();
        let stream = self.binding.get_mut(&origin)?;
        let mut line = String::new();
        match timeout(read_timeout, stream.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(origin.port("connection closed by peer")),
            Ok(Ok(_)) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => Err(origin.wrap(FaultKind::Port, "read failed", e)),
            Err(_) => Err(origin.port(format!("no line received within {:?}", read_timeout))),
        }
    }
}

#[async_trait]
impl Endpoint for SocketInterface {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.binding.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        info!(parent: &self.span, "connecting");
        let detail = || format!("Error connecting to the interface via IP: {}, port: {}", self.host, self.port);
        let stream = match timeout(self.connect_timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.origin.wrap(FaultKind::Connection, detail(), e)),
            Err(_) => {
                return Err(self
                    .origin
                    .connection(detail())
                    .with_original(format!("connect timed out after {:?}", self.connect_timeout)))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(parent: &self.span, error = %e, "could not disable Nagle");
        }
        self.binding.bind(BufReader::new(stream));
        Ok(())
    }

    async fn release(&mut self) {
        info!(parent: &self.span, "disconnecting");
        if let Some(mut stream) = self.binding.take() {
            if let Err(e) = stream.get_mut().shutdown().await {
                warn!(parent: &self.span, error = %e, "error closing socket");
            }
        }
    }

    async fn read(&mut self) -> FaultResult<Bytes> {
        let read_timeout = self.read_timeout;
        let origin = self.origin.clone();
        let stream = self.binding.get_mut(&origin)?;
        let mut buffer = vec![0u8; 4096];
        match timeout(read_timeout, stream.read(&mut buffer)).await {
            Ok(Ok(n)) => {
                buffer.truncate(n);
                Ok(Bytes::from(buffer))
            }
            Ok(Err(e)) => Err(origin.wrap(FaultKind::Port, "read failed", e)),
            Err(_) => Ok(Bytes::new()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> FaultResult<()> {
        let origin = self.origin.clone();
        let stream = self.binding.get_mut(&origin)?.get_mut();
        stream
            .write_all(data)
            .await
            .map_err(|e| origin.wrap(FaultKind::Port, "write failed", e))?;
        stream
            .flush()
            .await
            .map_err(|e| origin.wrap(FaultKind::Port, "flush failed", e))?;
        debug!(parent: &self.span, bytes = data.len(), "written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_write_and_read_line_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            socket
        });

        let mut socket = SocketInterface::new("127.0.0.1", port);
        socket.connect().await.unwrap();
        socket.write(b"hello\n").await.unwrap();
        assert_eq!(socket.read_line().await.unwrap(), "hello");
        let _peer = server.await.unwrap();
        socket.disconnect().await;
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_fault() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut socket = SocketInterface::new("127.0.0.1", port);
        let err = socket.connect().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Connection);
        assert!(err.detail.contains(&port.to_string()));
        assert!(err.original.is_some());
    }
}
