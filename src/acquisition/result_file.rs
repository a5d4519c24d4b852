//! Result file reader.
//!
//! The server writes each frame to a TIFF file asynchronously, after the readout has
//! been acknowledged. Reading it back is a two-phase poll that shares one deadline:
//!
//! 1. **Freshness**: wait until the file exists and its modification time is no more
//!    than [`CLOCK_SKEW_TOLERANCE_SECS`] older than the acquisition start. Older files
//!    are left over from a previous run and are skipped. A zero timeout accepts the
//!    first existing file without checking its age.
//! 2. **Completeness**: decode the file and require the header to declare exactly the
//!    expected dimensions and the payload to hold exactly `width * height * 2` bytes.
//!    Anything else is treated as a write still in progress and retried.
//!
//! Every retry sleeps `retry_delay` while watching the stop signal.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::codecs::tiff::TiffDecoder;
use image::ImageDecoder;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::core::{ImageBuffer, ImageDims, BYTES_PER_PIXEL};
use crate::error::{AppResult, DaqError};

use super::stop::StopSignal;

/// How much older than the acquisition start a result file may be.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 10;

/// Polls for, validates and decodes the server's result file.
#[derive(Clone, Copy, Debug)]
pub struct ResultFileReader {
    timeout: Duration,
    retry_delay: Duration,
}

impl ResultFileReader {
    /// Reader with an overall `timeout` and a fixed `retry_delay` between attempts.
    pub fn new(timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            timeout,
            retry_delay,
        }
    }

    /// Read `path` into `buffer`, whose dimensions are the expected image size.
    ///
    /// # Errors
    /// - [`DaqError::FileTimeout`] when no fresh, complete file appeared in time
    /// - [`DaqError::Cancelled`] when a stop arrived between attempts
    #[instrument(skip(self, buffer, stop), fields(dims = %buffer.dims()))]
    pub async fn read(
        &self,
        path: &Path,
        acquisition_start: DateTime<Utc>,
        buffer: &mut ImageBuffer,
        stop: &StopSignal,
    ) -> AppResult<()> {
        let deadline = Instant::now() + self.timeout;
        let stale_file_seen = self
            .wait_for_fresh_file(path, acquisition_start, deadline, stop)
            .await?;

        let expected = buffer.dims();
        loop {
            match decode_attempt(path.to_path_buf(), expected).await {
                Ok(pixels) => {
                    buffer.pixels_mut().copy_from_slice(&pixels);
                    debug!("Read {} ({})", path.display(), expected);
                    return Ok(());
                }
                Err(err) if err.is_transient_read() => {
                    debug!("Result file still being written: {}", err)
                }
                Err(err) => debug!("Result file not readable yet: {}", err),
            }
            self.pause(path, deadline, stale_file_seen, stop).await?;
        }
    }

    /// Phase 1. Returns whether a stale file was seen on the way.
    async fn wait_for_fresh_file(
        &self,
        path: &Path,
        acquisition_start: DateTime<Utc>,
        deadline: Instant,
        stop: &StopSignal,
    ) -> AppResult<bool> {
        let oldest_accepted =
            acquisition_start - chrono::Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS);
        let mut stale_file_seen = false;

        loop {
            if let Ok(metadata) = tokio::fs::metadata(path).await {
                if self.timeout.is_zero() {
                    return Ok(stale_file_seen);
                }
                let modified: DateTime<Utc> = metadata.modified()?.into();
                if modified >= oldest_accepted {
                    return Ok(stale_file_seen);
                }
                if !stale_file_seen {
                    warn!(
                        "{} was modified at {}, before acquisition start {}; waiting for a new file",
                        path.display(),
                        modified,
                        acquisition_start
                    );
                    stale_file_seen = true;
                }
            }
            self.pause(path, deadline, stale_file_seen, stop).await?;
        }
    }

    /// Fail when the deadline has passed, otherwise sleep one retry delay.
    async fn pause(
        &self,
        path: &Path,
        deadline: Instant,
        stale_file_seen: bool,
        stop: &StopSignal,
    ) -> AppResult<()> {
        if Instant::now() >= deadline {
            return Err(DaqError::FileTimeout {
                path: path.to_path_buf(),
                stale_file_seen,
            });
        }
        if stop.wait_timeout(self.retry_delay).await {
            return Err(DaqError::Cancelled);
        }
        Ok(())
    }
}

async fn decode_attempt(path: PathBuf, expected: ImageDims) -> AppResult<Vec<u16>> {
    tokio::task::spawn_blocking(move || decode_tiff(&path, expected))
        .await
        .map_err(|e| DaqError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// One decode attempt. Fails on any disagreement with `expected`.
fn decode_tiff(path: &Path, expected: ImageDims) -> AppResult<Vec<u16>> {
    let file = File::open(path)?;
    let decoder = TiffDecoder::new(BufReader::new(file)).map_err(invalid_data)?;

    let (width, height) = decoder.dimensions();
    let found = ImageDims::new(width, height);
    if found != expected {
        return Err(DaqError::DimensionMismatch { expected, found });
    }

    let total = usize::try_from(decoder.total_bytes()).unwrap_or(usize::MAX);
    if total != expected.payload_bytes() {
        return Err(DaqError::SizeMismatch {
            expected: expected.payload_bytes(),
            found: total,
        });
    }

    let mut bytes = vec![0u8; total];
    decoder.read_image(&mut bytes).map_err(invalid_data)?;

    Ok(bytes
        .chunks_exact(BYTES_PER_PIXEL)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect())
}

fn invalid_data(err: image::ImageError) -> DaqError {
    match err {
        image::ImageError::IoError(io) => DaqError::Io(io),
        other => DaqError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FrameAllocator, HeapAllocator};
    use std::sync::Arc;
    use std::time::SystemTime;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn write_tiff(path: &Path, dims: ImageDims, seed: u16) -> Vec<u16> {
        let pixels: Vec<u16> = (0..dims.pixel_count())
            .map(|i| (i as u16).wrapping_mul(31).wrapping_add(seed))
            .collect();
        image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(
            dims.width,
            dims.height,
            pixels.clone(),
        )
        .unwrap()
        .save(path)
        .unwrap();
        pixels
    }

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    fn reader(timeout_ms: u64) -> ResultFileReader {
        ResultFileReader::new(Duration::from_millis(timeout_ms), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_512_square_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame_001.tif");
        let dims = ImageDims::new(512, 512);
        let written = write_tiff(&path, dims, 7);

        let mut buffer = HeapAllocator.alloc(dims);
        reader(2000)
            .read(&path, Utc::now(), &mut buffer, &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(buffer.dims(), dims);
        assert_eq!(buffer.pixels(), written.as_slice());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stale_file_times_out_with_diagnostic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.tif");
        let dims = ImageDims::new(16, 16);
        write_tiff(&path, dims, 0);
        age_file(&path, Duration::from_secs(15));

        let mut buffer = HeapAllocator.alloc(dims);
        let err = reader(200)
            .read(&path, Utc::now(), &mut buffer, &StopSignal::new())
            .await
            .unwrap_err();

        match err {
            DaqError::FileTimeout {
                stale_file_seen, ..
            } => assert!(stale_file_seen),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(logs_contain("waiting for a new file"));
    }

    #[tokio::test]
    async fn test_file_within_skew_tolerance_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skewed.tif");
        let dims = ImageDims::new(16, 16);
        write_tiff(&path, dims, 3);
        age_file(&path, Duration::from_secs(5));

        let mut buffer = HeapAllocator.alloc(dims);
        reader(500)
            .read(&path, Utc::now(), &mut buffer, &StopSignal::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_timeout_skips_freshness() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flatfield.tif");
        let dims = ImageDims::new(8, 8);
        write_tiff(&path, dims, 1);
        age_file(&path, Duration::from_secs(3600));

        let mut buffer = HeapAllocator.alloc(dims);
        reader(0)
            .read(&path, Utc::now(), &mut buffer, &StopSignal::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("never.tif");
        let mut buffer = HeapAllocator.alloc(ImageDims::new(8, 8));

        let err = reader(100)
            .read(&path, Utc::now(), &mut buffer, &StopSignal::new())
            .await
            .unwrap_err();
        match err {
            DaqError::FileTimeout {
                path: reported,
                stale_file_seen,
            } => {
                assert_eq!(reported, path);
                assert!(!stale_file_seen);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_dimensions_are_retried_until_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.tif");
        write_tiff(&path, ImageDims::new(32, 32), 0);

        let mut buffer = HeapAllocator.alloc(ImageDims::new(64, 64));
        let err = reader(150)
            .read(&path, Utc::now(), &mut buffer, &StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::FileTimeout { .. }));
        assert!(buffer.pixels().iter().all(|&p| p == 0));
    }

    #[tokio::test]
    async fn test_truncated_file_is_retried_until_complete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("growing.tif");
        let dims = ImageDims::new(64, 64);

        // Half-written file first, then the complete one
        let scratch = dir.path().join("scratch.tif");
        let written = write_tiff(&scratch, dims, 9);
        let full = std::fs::read(&scratch).unwrap();
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();

        let finisher = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                std::fs::write(&path, &full).unwrap();
            })
        };

        let mut buffer = HeapAllocator.alloc(dims);
        reader(3000)
            .read(&path, Utc::now(), &mut buffer, &StopSignal::new())
            .await
            .unwrap();
        finisher.await.unwrap();
        assert_eq!(buffer.pixels(), written.as_slice());
    }

    #[tokio::test]
    async fn test_stop_cancels_wait() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.tif");
        let stop = Arc::new(StopSignal::new());
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let mut buffer = HeapAllocator.alloc(ImageDims::new(8, 8));
        let err = reader(10_000)
            .read(&path, Utc::now(), &mut buffer, &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Cancelled));
    }
}
