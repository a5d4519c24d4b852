//! Commands accepted by the detector worker.

use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::error::AppResult;
use crate::hardware::marccd::status::StatusWord;

/// Commands that can be sent to the [`DetectorActor`](super::DetectorActor).
#[derive(Debug)]
pub enum DetectorCommand {
    /// Run one acquisition cycle. The caller has already claimed the acquisition.
    Start,

    /// Stop request. The stop signal is already set; an idle worker aborts the server.
    Stop,

    /// Change binning and send it to the server
    SetBinning {
        /// Horizontal binning
        x: u32,
        /// Vertical binning
        y: u32,
        /// Completes once the server reported the new image size
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Write the current frame to the next file name
    WriteFile {
        /// The file written
        response: oneshot::Sender<AppResult<PathBuf>>,
    },

    /// Read the server state now
    RefreshState {
        /// Decoded status word
        response: oneshot::Sender<AppResult<StatusWord>>,
    },

    /// Stop the worker
    Shutdown {
        /// Acknowledged before the worker loop exits
        response: oneshot::Sender<()>,
    },
}

impl DetectorCommand {
    /// Helper to create a SetBinning command
    pub fn set_binning(x: u32, y: u32) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetBinning { x, y, response: tx }, rx)
    }

    /// Helper to create a WriteFile command
    pub fn write_file() -> (Self, oneshot::Receiver<AppResult<PathBuf>>) {
        let (tx, rx) = oneshot::channel();
        (Self::WriteFile { response: tx }, rx)
    }

    /// Helper to create a RefreshState command
    pub fn refresh_state() -> (Self, oneshot::Receiver<AppResult<StatusWord>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RefreshState { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
