//! Core data types for the detector driver.
//!
//! These are the values that cross module boundaries during a capture cycle:
//!
//! - [`FrameRequest`]: immutable snapshot of the acquisition settings, taken once at
//!   the start of every cycle
//! - [`SequenceOutcome`]: what the acquisition sequencer produced (buffer, result file,
//!   dimensions, start time), consumed immediately by the result file reader
//! - [`DecodedImage`]: the 16-bit image handed to the image sink, one per successful cycle
//!
//! # Data Flow
//!
//! ```text
//! SettingsStore --[FrameRequest]--> Sequencer --[SequenceOutcome]--> ResultFileReader
//!                                                                        |
//!                                            ImageSink <--[DecodedImage]-+
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Acquisition Settings
// =============================================================================

/// Frame type selects which acquisition sequence the server is driven through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Single exposure, corrected readout into buffer 0.
    #[default]
    Normal,
    /// Two minimal exposures combined with dezinger into the background buffer.
    Background,
    /// Single exposure, uncorrected readout into buffer 3.
    Raw,
    /// Two half-length exposures combined with dezinger.
    DoubleCorrelation,
}

impl FrameType {
    /// Server buffer that a single-exposure frame type reads out into.
    ///
    /// Only meaningful for [`FrameType::Normal`] and [`FrameType::Raw`].
    pub fn readout_buffer(self) -> u8 {
        match self {
            FrameType::Raw => 3,
            _ => 0,
        }
    }

    /// Whether files written for this frame type carry server-side corrections.
    pub fn corrected_on_write(self) -> bool {
        self != FrameType::Raw
    }
}

impl FromStr for FrameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "normal" => Ok(FrameType::Normal),
            "background" => Ok(FrameType::Background),
            "raw" => Ok(FrameType::Raw),
            "double_correlation" => Ok(FrameType::DoubleCorrelation),
            other => Err(format!("unknown frame type '{}'", other)),
        }
    }
}

/// Trigger source. Carried with every request; the server protocol has no trigger
/// command so only internal triggering changes the sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum TriggerMode {
    #[default]
    Internal,
    External,
    Alignment,
}

/// Who operates the shutter during an exposure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterMode {
    /// Shutter is not touched by the driver.
    #[default]
    None,
    /// The driver opens and closes the shutter through the server.
    Detector,
}

/// Snapshot of the acquisition settings for one cycle.
///
/// Changing live settings while a cycle runs never affects the snapshot the
/// cycle was started with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRequest {
    /// Total exposure time
    pub exposure_time: Duration,
    /// Requested number of images
    pub num_images: u32,
    /// Which acquisition sequence to run
    pub frame_type: FrameType,
    /// Trigger source
    pub trigger_mode: TriggerMode,
    /// Open and close the shutter around each exposure
    pub use_shutter: bool,
    /// Write the result to a file
    pub auto_save: bool,
    /// Overlap the next acquisition with the file write (do not wait for it)
    pub overlap_enabled: bool,
    /// Corrected flag used for explicit file writes
    pub corrected_on_write: bool,
}

impl FrameRequest {
    /// Whether readout waits for the server to finish writing the file.
    pub fn wait_for_write(&self) -> bool {
        !self.overlap_enabled
    }
}

impl Default for FrameRequest {
    fn default() -> Self {
        Self {
            exposure_time: Duration::from_secs(1),
            num_images: 1,
            frame_type: FrameType::Normal,
            trigger_mode: TriggerMode::Internal,
            use_shutter: false,
            auto_save: false,
            overlap_enabled: false,
            corrected_on_write: true,
        }
    }
}

// =============================================================================
// Images
// =============================================================================

/// Bytes per pixel of every image the server produces (16-bit unsigned).
pub const BYTES_PER_PIXEL: usize = 2;

/// Image width and height in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDims {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl ImageDims {
    /// Create dimensions from width and height.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of the full 16-bit payload in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }
}

impl fmt::Display for ImageDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Owned 16-bit pixel buffer sized for one image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageBuffer {
    dims: ImageDims,
    pixels: Vec<u16>,
}

impl ImageBuffer {
    /// Zero-filled buffer of the given size.
    pub fn zeroed(dims: ImageDims) -> Self {
        Self {
            dims,
            pixels: vec![0u16; dims.pixel_count()],
        }
    }

    /// Image dimensions.
    pub fn dims(&self) -> ImageDims {
        self.dims
    }

    /// Pixel data, row-major.
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Mutable pixel data, row-major.
    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    /// Tag the filled buffer with its sequence id and acquisition time.
    pub fn into_image(self, id: u64, timestamp: DateTime<Utc>) -> DecodedImage {
        DecodedImage {
            id,
            timestamp,
            dims: self.dims,
            pixels: self.pixels,
        }
    }
}

/// Allocates result buffers for decoded images.
pub trait FrameAllocator: Send + Sync {
    /// Allocate a buffer able to hold an image of `dims`.
    fn alloc(&self, dims: ImageDims) -> ImageBuffer;
}

/// Allocator that takes a fresh buffer from the heap for every frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl FrameAllocator for HeapAllocator {
    fn alloc(&self, dims: ImageDims) -> ImageBuffer {
        ImageBuffer::zeroed(dims)
    }
}

/// A complete image read back from the detector server.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedImage {
    /// Monotonically increasing sequence id (image counter)
    pub id: u64,
    /// When the acquisition producing this image started
    pub timestamp: DateTime<Utc>,
    /// Image dimensions
    pub dims: ImageDims,
    /// Row-major 16-bit pixels
    pub pixels: Vec<u16>,
}

// =============================================================================
// Cycle Results
// =============================================================================

/// What one acquisition sequence produced, before the result file is read.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceOutcome {
    /// Server buffer holding the final frame
    pub buffer_number: u8,
    /// File the server writes the frame to; `None` when nothing is saved
    pub result_path: Option<PathBuf>,
    /// Image dimensions reported by the server after the sequence
    pub image_dims: ImageDims,
    /// Wall-clock time the first exposure of the sequence started
    pub acquisition_start: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readout_buffer_selection() {
        assert_eq!(FrameType::Normal.readout_buffer(), 0);
        assert_eq!(FrameType::Raw.readout_buffer(), 3);
        assert!(FrameType::Normal.corrected_on_write());
        assert!(!FrameType::Raw.corrected_on_write());
    }

    #[test]
    fn test_frame_type_from_str() {
        assert_eq!(
            "double-correlation".parse::<FrameType>(),
            Ok(FrameType::DoubleCorrelation)
        );
        assert_eq!("Background".parse::<FrameType>(), Ok(FrameType::Background));
        assert!("flat".parse::<FrameType>().is_err());
    }

    #[test]
    fn test_image_dims_sizes() {
        let dims = ImageDims::new(1024, 512);
        assert_eq!(dims.pixel_count(), 524_288);
        assert_eq!(dims.payload_bytes(), 1_048_576);
        assert_eq!(dims.to_string(), "1024x512");
    }

    #[test]
    fn test_buffer_into_image_keeps_pixels() {
        let mut buffer = HeapAllocator.alloc(ImageDims::new(2, 2));
        buffer.pixels_mut().copy_from_slice(&[1, 2, 3, 4]);
        let stamp = Utc::now();
        let image = buffer.into_image(7, stamp);
        assert_eq!(image.id, 7);
        assert_eq!(image.timestamp, stamp);
        assert_eq!(image.pixels, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_overlap_controls_write_wait() {
        let mut request = FrameRequest::default();
        assert!(request.wait_for_write());
        request.overlap_enabled = true;
        assert!(!request.wait_for_write());
    }
}
