//! Where decoded images go.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::DecodedImage;
use crate::error::{AppResult, DaqError};

/// Receives one image per successful cycle. Ownership passes to the sink.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Hand over a decoded image.
    async fn publish(&self, image: DecodedImage) -> AppResult<()>;
}

#[async_trait]
impl ImageSink for mpsc::Sender<DecodedImage> {
    async fn publish(&self, image: DecodedImage) -> AppResult<()> {
        self.send(image)
            .await
            .map_err(|_| DaqError::ImageSinkClosed)
    }
}

/// Sink that drops every image.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardSink;

#[async_trait]
impl ImageSink for DiscardSink {
    async fn publish(&self, _image: DecodedImage) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ImageDims;
    use chrono::Utc;

    fn image(id: u64) -> DecodedImage {
        DecodedImage {
            id,
            timestamp: Utc::now(),
            dims: ImageDims::new(1, 1),
            pixels: vec![0],
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.publish(image(1)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_reports_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(matches!(
            tx.publish(image(1)).await,
            Err(DaqError::ImageSinkClosed)
        ));
    }
}
