//! Line-oriented request/response transport
//!
//! The detector server speaks one ASCII line per request and per reply over a
//! persistent stream connection. [`LineTransport`] owns that connection and enforces
//! two rules:
//!
//! - every `send` first discards input that is already waiting, so a late reply to a
//!   previous request can never be read as the answer to the next one
//! - every `recv` is bounded by an explicit timeout and reports it as an error
//!
//! Nothing is retried here; callers decide what a failed exchange means. Every line
//! in either direction is mirrored into an [`Observable`] for diagnostics.

use std::time::Duration;

use futures::FutureExt;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};
use crate::observable::Observable;

/// Byte stream the transport can run over (TCP in production, in-memory pipes in tests).
pub trait ServerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ServerStream for T {}

/// Request/response text-line channel to the detector server.
pub struct LineTransport {
    stream: BufReader<Box<dyn ServerStream>>,
    terminator: String,
    read_timeout: Duration,
    last_request: Option<String>,
    to_server: Option<Observable<String>>,
    from_server: Option<Observable<String>>,
}

impl std::fmt::Debug for LineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineTransport")
            .field("terminator", &self.terminator)
            .field("read_timeout", &self.read_timeout)
            .field("last_request", &self.last_request)
            .finish()
    }
}

impl LineTransport {
    /// Wrap an established stream.
    ///
    /// # Arguments
    /// * `stream` - Connected byte stream
    /// * `read_timeout` - Default timeout for replies
    /// * `terminator` - Appended to every request line (usually `"\n"`)
    pub fn new<S>(stream: S, read_timeout: Duration, terminator: impl Into<String>) -> Self
    where
        S: ServerStream + 'static,
    {
        Self {
            stream: BufReader::new(Box::new(stream)),
            terminator: terminator.into(),
            read_timeout,
            last_request: None,
            to_server: None,
            from_server: None,
        }
    }

    /// Connect to a detector server over TCP.
    pub async fn connect(
        address: &str,
        read_timeout: Duration,
        terminator: impl Into<String>,
    ) -> AppResult<Self> {
        let stream = tokio::time::timeout(read_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DaqError::ProtocolTimeout {
                command: format!("connect {}", address),
                timeout: read_timeout,
            })??;
        stream.set_nodelay(true)?;
        debug!("Connected to detector server at {}", address);
        Ok(Self::new(stream, read_timeout, terminator))
    }

    /// Mirror every sent and received line into these observables.
    pub fn with_mirrors(
        mut self,
        to_server: Observable<String>,
        from_server: Observable<String>,
    ) -> Self {
        self.to_server = Some(to_server);
        self.from_server = Some(from_server);
        self
    }

    /// Default reply timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Discard stale input, then write `line` plus the terminator.
    pub async fn send(&mut self, line: &str) -> AppResult<()> {
        let discarded = self.flush_input();
        if discarded > 0 {
            warn!("Discarded {} stale bytes before '{}'", discarded, line);
        }

        let payload = format!("{}{}", line, self.terminator);
        self.stream.get_mut().write_all(payload.as_bytes()).await?;
        self.stream.get_mut().flush().await?;

        debug!("-> {}", line);
        self.last_request = Some(line.to_string());
        if let Some(mirror) = &self.to_server {
            mirror.set(line.to_string());
        }
        Ok(())
    }

    /// Wait up to `timeout` for one terminated line.
    pub async fn recv(&mut self, timeout: Duration) -> AppResult<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(timeout, self.stream.read_line(&mut line)).await;
        let n = match read {
            Ok(result) => result?,
            Err(_) => {
                return Err(DaqError::ProtocolTimeout {
                    command: self.last_request.clone().unwrap_or_default(),
                    timeout,
                })
            }
        };
        if n == 0 {
            return Err(DaqError::ConnectionClosed);
        }

        let reply = line.trim_end_matches(['\r', '\n']).to_string();
        debug!("<- {}", reply);
        if let Some(mirror) = &self.from_server {
            mirror.set(reply.clone());
        }
        Ok(reply)
    }

    /// `send` followed by `recv`.
    pub async fn send_recv(&mut self, line: &str, timeout: Duration) -> AppResult<String> {
        self.send(line).await?;
        self.recv(timeout).await
    }

    /// Drop everything already buffered or immediately readable. Never blocks.
    fn flush_input(&mut self) -> usize {
        let buffered = self.stream.buffer().len();
        self.stream.consume(buffered);

        let mut discarded = buffered;
        let mut scratch = [0u8; 256];
        loop {
            match self.stream.get_mut().read(&mut scratch).now_or_never() {
                Some(Ok(n)) if n > 0 => discarded += n,
                _ => break,
            }
        }
        discarded
    }
}
