//! marccd server command set
//!
//! Commands are ASCII, comma separated and newline terminated. Only `get_state` and
//! `get_size` produce a reply the driver parses; anything else the server sends back
//! is acknowledgement text and is discarded by the next request's input flush.

use std::fmt;
use std::path::PathBuf;

use prse::try_parse;

use crate::core::ImageDims;
use crate::error::{AppResult, DaqError};

use super::status::StatusWord;

/// One request line to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerCommand {
    /// Query the status word
    GetState,
    /// Query current image dimensions
    GetSize,
    /// Start an acquisition
    Start,
    /// Abort whatever the server is doing
    Abort,
    /// Open (`true`) or close the shutter
    Shutter(bool),
    /// Set binning
    SetBin {
        /// Horizontal binning
        x: u32,
        /// Vertical binning
        y: u32,
    },
    /// Read the CCD into a server buffer, optionally writing a file
    Readout {
        /// Server buffer number
        buffer: u8,
        /// File to write once read out
        file: Option<PathBuf>,
    },
    /// Write the current frame to a file
    WriteFile {
        /// Output file
        file: PathBuf,
        /// Apply corrections before writing
        corrected: bool,
    },
    /// Combine two buffers removing zingers; the flag selects the target
    Dezinger(u8),
}

impl ServerCommand {
    /// Whether the server answers this command with a reply the driver reads.
    pub fn expects_reply(&self) -> bool {
        matches!(self, ServerCommand::GetState | ServerCommand::GetSize)
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerCommand::GetState => write!(f, "get_state"),
            ServerCommand::GetSize => write!(f, "get_size"),
            ServerCommand::Start => write!(f, "start"),
            ServerCommand::Abort => write!(f, "abort"),
            ServerCommand::Shutter(open) => write!(f, "shutter,{}", u8::from(*open)),
            ServerCommand::SetBin { x, y } => write!(f, "set_bin,{},{}", x, y),
            ServerCommand::Readout { buffer, file } => match file {
                Some(path) if !path.as_os_str().is_empty() => {
                    write!(f, "readout,{},{}", buffer, path.display())
                }
                _ => write!(f, "readout,{}", buffer),
            },
            ServerCommand::WriteFile { file, corrected } => {
                write!(f, "writefile,{},{}", file.display(), u8::from(*corrected))
            }
            ServerCommand::Dezinger(mode) => write!(f, "dezinger,{}", mode),
        }
    }
}

/// Parse a `get_state` reply. Accepts decimal and `0x` hexadecimal.
pub fn parse_state(reply: &str) -> AppResult<StatusWord> {
    let text = reply.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed
        .map(StatusWord::decode)
        .map_err(|_| DaqError::Protocol(format!("invalid state reply '{}'", text)))
}

/// Parse a `get_size` reply of the form `<width>,<height>`.
pub fn parse_size(reply: &str) -> AppResult<ImageDims> {
    let text = reply.trim();
    let (width, height): (u32, u32) = try_parse!(text, "{},{}")
        .map_err(|e| DaqError::Protocol(format!("invalid size reply '{}': {}", text, e)))?;
    Ok(ImageDims::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::marccd::status::TaskKind;

    #[test]
    fn test_command_encoding() {
        assert_eq!(ServerCommand::GetState.to_string(), "get_state");
        assert_eq!(ServerCommand::Shutter(true).to_string(), "shutter,1");
        assert_eq!(ServerCommand::Shutter(false).to_string(), "shutter,0");
        assert_eq!(ServerCommand::SetBin { x: 2, y: 4 }.to_string(), "set_bin,2,4");
        assert_eq!(ServerCommand::Dezinger(1).to_string(), "dezinger,1");
        assert_eq!(
            ServerCommand::WriteFile {
                file: PathBuf::from("/data/bg_001.tif"),
                corrected: false,
            }
            .to_string(),
            "writefile,/data/bg_001.tif,0"
        );
    }

    #[test]
    fn test_readout_omits_empty_file_name() {
        let with_file = ServerCommand::Readout {
            buffer: 0,
            file: Some(PathBuf::from("/data/img_001.tif")),
        };
        assert_eq!(with_file.to_string(), "readout,0,/data/img_001.tif");

        let empty = ServerCommand::Readout {
            buffer: 2,
            file: Some(PathBuf::new()),
        };
        assert_eq!(empty.to_string(), "readout,2");

        let none = ServerCommand::Readout {
            buffer: 1,
            file: None,
        };
        assert_eq!(none.to_string(), "readout,1");
    }

    #[test]
    fn test_only_queries_expect_replies() {
        assert!(ServerCommand::GetState.expects_reply());
        assert!(ServerCommand::GetSize.expects_reply());
        assert!(!ServerCommand::Start.expects_reply());
        assert!(!ServerCommand::Abort.expects_reply());
    }

    #[test]
    fn test_parse_state() {
        let status = parse_state("32\n").unwrap();
        assert_eq!(status.raw(), 32);
        assert!(status.is_executing(TaskKind::Acquire));
        assert_eq!(parse_state("0x20").unwrap().raw(), 32);
        assert!(matches!(parse_state("busy"), Err(DaqError::Protocol(_))));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024,1024\n").unwrap(), ImageDims::new(1024, 1024));
        assert_eq!(parse_size(" 2048,1024").unwrap(), ImageDims::new(2048, 1024));
        assert!(matches!(parse_size("1024"), Err(DaqError::Protocol(_))));
        assert!(matches!(parse_size("a,b"), Err(DaqError::Protocol(_))));
    }
}
