//! Custom error types for the detector driver.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of
//! the driver. Using the `thiserror` crate, it provides one place where the failure
//! modes of an acquisition cycle are named and displayed.
//!
//! ## Error Hierarchy
//!
//! - **`Io`**, **`ProtocolTimeout`**, **`ConnectionClosed`**: the connection to the
//!   detector server failed. All three abort the current cycle; the sequencer loop
//!   returns to idle and waits for the next start.
//! - **`Protocol`**: the server answered `get_state` or `get_size` with text that could
//!   not be parsed.
//! - **`FileTimeout`**: the result file never appeared, or never became complete,
//!   within the read timeout. `stale_file_seen` records that a file existed but was
//!   older than the acquisition (usually a clock synchronisation problem).
//! - **`DimensionMismatch`** / **`SizeMismatch`**: a single read attempt found a header
//!   or payload that disagrees with the expected image. The result file reader treats
//!   these as partial writes and retries; they only surface from single attempts.
//! - **`Cancelled`**: a stop request was observed. Not a fault: the cycle ends without
//!   publishing an image and the server is told to abort.
//! - **`Configuration`** / **`Config`**: semantic and loading errors for the
//!   configuration file.
//! - **`ActorStopped`** / **`ImageSinkClosed`**: the other end of a channel is gone.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::ImageDims;

/// Convenience alias for results using the driver error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response to '{command}' within {timeout:?}")]
    ProtocolTimeout { command: String, timeout: Duration },

    #[error("Connection to detector server closed")]
    ConnectionClosed,

    #[error("Unexpected server response: {0}")]
    Protocol(String),

    #[error("Timeout waiting for result file {}{}", path.display(), if *stale_file_seen { " (file exists but is more than 10 seconds old, possible clock synchronization problem)" } else { "" })]
    FileTimeout {
        path: PathBuf,
        stale_file_seen: bool,
    },

    #[error("Image dimensions incorrect: found {found}, expected {expected}")]
    DimensionMismatch { expected: ImageDims, found: ImageDims },

    #[error("Image payload size incorrect: found {found} bytes, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("Acquisition cancelled")]
    Cancelled,

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Detector worker is not running")]
    ActorStopped,

    #[error("Image consumer has gone away")]
    ImageSinkClosed,
}

impl DaqError {
    /// True for failures of the server connection itself.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            DaqError::Io(_) | DaqError::ProtocolTimeout { .. } | DaqError::ConnectionClosed
        )
    }

    /// True when the error is a retryable single-attempt read failure.
    pub fn is_transient_read(&self) -> bool {
        matches!(
            self,
            DaqError::DimensionMismatch { .. } | DaqError::SizeMismatch { .. }
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::ProtocolTimeout {
            command: "get_state".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.to_string(), "No response to 'get_state' within 1s");
        assert!(err.is_io());
    }

    #[test]
    fn test_stale_file_diagnostic() {
        let fresh = DaqError::FileTimeout {
            path: PathBuf::from("/data/a.tif"),
            stale_file_seen: false,
        };
        let stale = DaqError::FileTimeout {
            path: PathBuf::from("/data/a.tif"),
            stale_file_seen: true,
        };
        assert!(!fresh.to_string().contains("clock"));
        assert!(stale.to_string().contains("clock synchronization"));
    }

    #[test]
    fn test_transient_classification() {
        let err = DaqError::SizeMismatch {
            expected: 8,
            found: 4,
        };
        assert!(err.is_transient_read());
        assert!(!err.is_io());
        assert!(!DaqError::Cancelled.is_transient_read());
    }
}
