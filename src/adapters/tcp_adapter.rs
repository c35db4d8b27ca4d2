use crate::adapters::ScpiTransport;
use crate::config::InstrumentEndpoint;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Size of the single read that makes up one reply.
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Persistent TCP connection to an instrument's raw SCPI socket.
///
/// Commands are written as `<command>\n`. A reply is whatever one read of up
/// to [`RECEIVE_BUFFER_SIZE`] bytes returns, decoded as UTF-8 (lossy) with
/// trailing whitespace trimmed.
#[derive(Debug)]
pub struct TcpAdapter {
    name: String,
    host: String,
    port: u16,
    io_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpAdapter {
    /// Connect using an endpoint from the configuration and reset the
    /// instrument.
    pub async fn connect(name: &str, endpoint: &InstrumentEndpoint) -> AppResult<Self> {
        Self::connect_to(
            name,
            &endpoint.host,
            endpoint.port,
            endpoint.connect_timeout,
            endpoint.io_timeout,
        )
        .await
    }

    /// Open the socket, then send the abort-and-clear reset once.
    ///
    /// # Errors
    /// `DaqError::Connection` if the socket cannot be opened within
    /// `connect_timeout`.
    pub async fn connect_to(
        name: &str,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> AppResult<Self> {
        let connection_error = |source: io::Error| DaqError::Connection {
            host: host.to_string(),
            port,
            source,
        };

        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                connection_error(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {:?}", connect_timeout),
                ))
            })?
            .map_err(connection_error)?;
        stream.set_nodelay(true)?;

        info!("{} connected at {}:{}", name, host, port);

        let mut adapter = Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            io_timeout,
            stream: Some(stream),
        };
        adapter.reset().await?;
        Ok(adapter)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn stream(&mut self) -> AppResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(DaqError::NotConnected)
    }
}

#[async_trait]
impl ScpiTransport for TcpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        let io_timeout = self.io_timeout;
        let line = format!("{}\n", command);
        let stream = self.stream()?;

        timeout(io_timeout, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| DaqError::Io(io::Error::from(io::ErrorKind::TimedOut)))??;

        debug!("{} <- {}", self.name, command);
        Ok(())
    }

    async fn receive(&mut self) -> AppResult<String> {
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];

        let n = timeout(io_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| DaqError::Io(io::Error::from(io::ErrorKind::TimedOut)))??;
        if n == 0 {
            return Err(DaqError::Transport(format!(
                "{} closed the connection",
                self.name
            )));
        }

        let reply = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
        debug!("{} -> {}", self.name, reply);
        Ok(reply)
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // Best effort: the peer may already be gone.
            let _ = stream.shutdown().await;
            info!("{} disconnected", self.name);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_connect_sends_reset_then_round_trips() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let reset = lines.next_line().await.unwrap().unwrap();
            let query = lines.next_line().await.unwrap().unwrap();
            write.write_all(b"1\r\n").await.unwrap();
            (reset, query)
        });

        let mut adapter = TcpAdapter::connect_to(
            "recorder",
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let reply = adapter.query("STATus:RECorder?").await.unwrap();
        assert_eq!(reply, "1");

        let (reset, query) = server.await.unwrap();
        assert_eq!(reset, "*RST; *WAI; *CLS");
        assert_eq!(query, "STATus:RECorder?");
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        let (listener, port) = listener().await;
        drop(listener);
        let err = TcpAdapter::connect_to(
            "analyzer",
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.is_connection(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_receive_times_out_as_io_error() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut adapter = TcpAdapter::connect_to(
            "recorder",
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let err = adapter.receive().await.unwrap_err();
        assert!(matches!(err, DaqError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut adapter = TcpAdapter::connect_to(
            "analyzer",
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        adapter.disconnect().await.unwrap();
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
        assert!(matches!(adapter.send("*IDN?").await, Err(DaqError::NotConnected)));
    }
}
