//! Typed client for the marccd server.
//!
//! One method per server command. `get_state` decodes the reply once and publishes the
//! per-task status and the overall classification, so every poll the sequencer makes
//! keeps the status surface current.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::acquisition::poll::StatusSource;
use crate::core::ImageDims;
use crate::detector::status::{DetectorState, StatusPublisher};
use crate::error::AppResult;
use crate::hardware::transport::LineTransport;

use super::protocol::{parse_size, parse_state, ServerCommand};
use super::status::StatusWord;

/// Protocol client for one detector server connection.
pub struct MarCcdClient {
    transport: LineTransport,
    publisher: Arc<dyn StatusPublisher>,
}

impl MarCcdClient {
    /// Create a client over an established transport.
    pub fn new(transport: LineTransport, publisher: Arc<dyn StatusPublisher>) -> Self {
        Self {
            transport,
            publisher,
        }
    }

    /// Send a command that has no reply.
    pub async fn command(&mut self, command: ServerCommand) -> AppResult<()> {
        debug_assert!(!command.expects_reply());
        self.transport.send(&command.to_string()).await
    }

    async fn query(&mut self, command: ServerCommand) -> AppResult<String> {
        let timeout = self.transport.read_timeout();
        self.transport
            .send_recv(&command.to_string(), timeout)
            .await
    }

    /// Read and publish the server status.
    pub async fn get_state(&mut self) -> AppResult<StatusWord> {
        let reply = self.query(ServerCommand::GetState).await?;
        let status = parse_state(&reply)?;
        self.publisher.set_task_status(status.tasks());
        self.publisher
            .set_state(DetectorState::from(status.classify()));
        Ok(status)
    }

    /// Current image dimensions.
    pub async fn get_size(&mut self) -> AppResult<ImageDims> {
        let reply = self.query(ServerCommand::GetSize).await?;
        let dims = parse_size(&reply)?;
        self.publisher.set_image_size(dims);
        Ok(dims)
    }

    /// Start an acquisition.
    pub async fn start(&mut self) -> AppResult<()> {
        self.command(ServerCommand::Start).await
    }

    /// Abort the current server operation.
    #[instrument(skip(self))]
    pub async fn abort(&mut self) -> AppResult<()> {
        debug!("Sending abort");
        self.command(ServerCommand::Abort).await
    }

    /// Open or close the shutter.
    pub async fn shutter(&mut self, open: bool) -> AppResult<()> {
        self.command(ServerCommand::Shutter(open)).await
    }

    /// Set detector binning.
    pub async fn set_bin(&mut self, x: u32, y: u32) -> AppResult<()> {
        self.command(ServerCommand::SetBin { x, y }).await
    }

    /// Read the CCD into `buffer`, writing `file` when given.
    pub async fn readout(&mut self, buffer: u8, file: Option<&Path>) -> AppResult<()> {
        self.command(ServerCommand::Readout {
            buffer,
            file: file.map(Path::to_path_buf),
        })
        .await
    }

    /// Write the current frame to `file`.
    pub async fn write_file(&mut self, file: &Path, corrected: bool) -> AppResult<()> {
        self.command(ServerCommand::WriteFile {
            file: file.to_path_buf(),
            corrected,
        })
        .await
    }

    /// Combine buffers removing zingers.
    pub async fn dezinger(&mut self, mode: u8) -> AppResult<()> {
        self.command(ServerCommand::Dezinger(mode)).await
    }
}

#[async_trait]
impl StatusSource for MarCcdClient {
    async fn fetch_status(&mut self) -> AppResult<StatusWord> {
        self.get_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::status::DetectorStatus;
    use crate::hardware::marccd::status::{TaskKind, TaskStatus};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_get_state_publishes_status() {
        let (client_end, server_end) = duplex(1024);
        let status = DetectorStatus::new();
        let transport = LineTransport::new(client_end, Duration::from_secs(1), "\n");
        let mut client = MarCcdClient::new(transport, Arc::new(status.clone()));

        let server = tokio::spawn(async move {
            let mut server = BufReader::new(server_end);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim(), "get_state");
            // readout executing
            server.write_all(b"512\n").await.unwrap();
        });

        let word = client.get_state().await.unwrap();
        server.await.unwrap();

        assert!(word.is_executing(TaskKind::Readout));
        assert_eq!(status.state.get(), DetectorState::Readout);
        assert_eq!(
            status.task_status.get().get(TaskKind::Readout),
            TaskStatus::EXECUTING
        );
    }

    #[tokio::test]
    async fn test_get_size_publishes_dims() {
        let (client_end, server_end) = duplex(1024);
        let status = DetectorStatus::new();
        let transport = LineTransport::new(client_end, Duration::from_secs(1), "\n");
        let mut client = MarCcdClient::new(transport, Arc::new(status.clone()));

        let server = tokio::spawn(async move {
            let mut server = BufReader::new(server_end);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            server.write_all(b"2048,1024\n").await.unwrap();
        });

        let dims = client.get_size().await.unwrap();
        server.await.unwrap();
        assert_eq!(dims, ImageDims::new(2048, 1024));
        assert_eq!(status.image_size.get(), dims);
    }
}
