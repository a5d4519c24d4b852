//! Acquisition sequencer.
//!
//! Drives the server through one capture cycle. Every command for a server task is
//! preceded by a wait until that task is neither queued nor executing, because the
//! server only accepts work for an idle task. A single exposure runs through
//!
//! ```text
//! WaitIdle -> Starting -> WaitExecuting -> Exposing -> ShutterClosing
//!          -> WaitReadoutDone -> WaitWriteDone (optional) -> Done
//! ```
//!
//! and the frame type decides how many exposures are taken and how they are combined:
//!
//! | Frame type          | Sequence                                                        |
//! |---------------------|-----------------------------------------------------------------|
//! | `Normal` / `Raw`    | expose, `readout,<0 or 3>[,file]`                               |
//! | `Background`        | 1 ms dark, `readout,1`, 1 ms dark, `readout,2`, `dezinger,1`    |
//! | `DoubleCorrelation` | t/2, `readout,2`, t/2, `readout,0`, `dezinger,0`, `writefile`  |
//!
//! Overlap only skips the write wait after a single readout. Combined frames always
//! wait for their explicit `writefile` to finish.
//!
//! A stop observed at any wait ends the cycle with [`DaqError::Cancelled`]; sending
//! `abort` to the server is left to the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::core::{FrameRequest, FrameType, ImageDims, SequenceOutcome};
use crate::detector::status::StatusPublisher;
use crate::error::{AppResult, DaqError};
use crate::hardware::marccd::client::MarCcdClient;
use crate::hardware::marccd::status::{StatusWord, TaskKind};

use super::exposure::{run_exposure, ExposureOutcome};
use super::poll::{poll_until, task_executing, task_settled, PollOutcome};
use super::stop::StopSignal;

/// Length of the dark exposures taken for a background frame.
pub const BACKGROUND_EXPOSURE: Duration = Duration::from_millis(1);

/// Minimum settle time after opening the shutter.
const MIN_SHUTTER_SETTLE: Duration = Duration::from_millis(1);

/// Where the sequencer is within the current exposure/readout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SequencerPhase {
    WaitIdle,
    Starting,
    WaitExecuting,
    Exposing,
    ShutterClosing,
    WaitReadoutDone,
    WaitWriteDone,
    Done,
}

/// Intervals and delays used during a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequencerTiming {
    /// Sleep between status polls
    pub poll_interval: Duration,
    /// Exposure timer wake interval
    pub exposure_tick: Duration,
    /// Time the shutter needs to open
    pub shutter_open_delay: Duration,
    /// Time the shutter needs to close
    pub shutter_close_delay: Duration,
}

impl Default for SequencerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            exposure_tick: Duration::from_millis(10),
            shutter_open_delay: Duration::ZERO,
            shutter_close_delay: Duration::ZERO,
        }
    }
}

/// A finished sequence, before the image size has been queried.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedSequence {
    /// Server buffer holding the final frame
    pub buffer_number: u8,
    /// File the server writes, if any
    pub result_path: Option<PathBuf>,
    /// When the first exposure was started
    pub acquisition_start: DateTime<Utc>,
}

impl CompletedSequence {
    /// Attach the image size reported after the sequence.
    pub fn into_outcome(self, image_dims: ImageDims) -> SequenceOutcome {
        SequenceOutcome {
            buffer_number: self.buffer_number,
            result_path: self.result_path,
            image_dims,
            acquisition_start: self.acquisition_start,
        }
    }
}

/// One capture cycle's state machine.
pub struct AcquisitionSequencer<'a> {
    client: &'a mut MarCcdClient,
    stop: &'a StopSignal,
    publisher: &'a dyn StatusPublisher,
    timing: SequencerTiming,
    phase: SequencerPhase,
    acquisition_start: Option<DateTime<Utc>>,
}

impl<'a> AcquisitionSequencer<'a> {
    /// Wire a sequencer for one cycle.
    pub fn new(
        client: &'a mut MarCcdClient,
        stop: &'a StopSignal,
        publisher: &'a dyn StatusPublisher,
        timing: SequencerTiming,
    ) -> Self {
        Self {
            client,
            stop,
            publisher,
            timing,
            phase: SequencerPhase::Done,
            acquisition_start: None,
        }
    }

    /// Run the full sequence for `request`. `file` is where the server should save
    /// the frame; `None` leaves the frame in server memory only.
    #[instrument(skip(self, request), fields(frame_type = ?request.frame_type))]
    pub async fn run(
        mut self,
        request: &FrameRequest,
        file: Option<PathBuf>,
    ) -> AppResult<CompletedSequence> {
        info!(
            "Starting {:?} frame, exposure {:?}, {} image(s), trigger {:?}",
            request.frame_type, request.exposure_time, request.num_images, request.trigger_mode
        );
        let wait_write = request.wait_for_write();

        let buffer_number = match request.frame_type {
            FrameType::Normal | FrameType::Raw => {
                let buffer = request.frame_type.readout_buffer();
                self.acquire_frame(request.exposure_time, request.use_shutter)
                    .await?;
                self.readout_frame(buffer, file.as_deref(), wait_write)
                    .await?;
                buffer
            }
            FrameType::Background => {
                self.acquire_frame(BACKGROUND_EXPOSURE, false).await?;
                self.readout_frame(1, None, true).await?;
                self.acquire_frame(BACKGROUND_EXPOSURE, false).await?;
                self.readout_frame(2, None, true).await?;
                self.dezinger_combine(1).await?;
                if let Some(path) = file.as_deref() {
                    self.save_file(path, false, true).await?;
                }
                1
            }
            FrameType::DoubleCorrelation => {
                let half = request.exposure_time / 2;
                self.acquire_frame(half, request.use_shutter).await?;
                self.readout_frame(2, None, true).await?;
                self.acquire_frame(half, request.use_shutter).await?;
                self.readout_frame(0, None, true).await?;
                self.dezinger_combine(0).await?;
                if let Some(path) = file.as_deref() {
                    self.save_file(path, true, true).await?;
                }
                0
            }
        };

        self.enter(SequencerPhase::Done);
        Ok(CompletedSequence {
            buffer_number,
            result_path: file,
            acquisition_start: self.acquisition_start.unwrap_or_else(Utc::now),
        })
    }

    /// Start one exposure and hold it for `exposure`.
    ///
    /// On a stop the shutter is closed again before `Cancelled` is returned.
    pub async fn acquire_frame(&mut self, exposure: Duration, use_shutter: bool) -> AppResult<()> {
        self.enter(SequencerPhase::WaitIdle);
        self.wait_for(task_settled(TaskKind::Acquire)).await?;

        self.enter(SequencerPhase::Starting);
        self.client.start().await?;
        if self.acquisition_start.is_none() {
            self.acquisition_start = Some(Utc::now());
        }

        self.enter(SequencerPhase::WaitExecuting);
        self.wait_for(task_executing(TaskKind::Acquire)).await?;

        self.enter(SequencerPhase::Exposing);
        self.publisher.set_message("Starting exposure");
        if use_shutter {
            self.client.shutter(true).await?;
            let settle = self
                .timing
                .shutter_open_delay
                .saturating_sub(self.timing.shutter_close_delay)
                .max(MIN_SHUTTER_SETTLE);
            tokio::time::sleep(settle).await;
        }

        let publisher = self.publisher;
        let outcome = run_exposure(exposure, self.timing.exposure_tick, self.stop, |remaining| {
            publisher.set_time_remaining(remaining)
        })
        .await;

        self.enter(SequencerPhase::ShutterClosing);
        if use_shutter {
            self.client.shutter(false).await?;
            tokio::time::sleep(self.timing.shutter_close_delay).await;
        }

        match outcome {
            ExposureOutcome::Completed => Ok(()),
            ExposureOutcome::Aborted { remaining } => {
                debug!("Exposure stopped with {:?} left", remaining);
                self.publisher.set_time_remaining(Duration::ZERO);
                Err(DaqError::Cancelled)
            }
        }
    }

    /// Read the CCD into `buffer`, optionally writing `file`.
    ///
    /// Waits for the readout to finish, and for the file write too when `wait_write`
    /// is set and a file was requested.
    pub async fn readout_frame(
        &mut self,
        buffer: u8,
        file: Option<&Path>,
        wait_write: bool,
    ) -> AppResult<()> {
        self.enter(SequencerPhase::WaitIdle);
        self.wait_for(task_settled(TaskKind::Readout)).await?;

        self.client.readout(buffer, file).await?;

        self.enter(SequencerPhase::WaitReadoutDone);
        self.wait_for(task_settled(TaskKind::Readout)).await?;

        if wait_write && file.is_some() {
            self.enter(SequencerPhase::WaitWriteDone);
            self.wait_for(task_settled(TaskKind::Write)).await?;
        }
        Ok(())
    }

    /// Write the current frame to `file`.
    pub async fn save_file(&mut self, file: &Path, corrected: bool, wait: bool) -> AppResult<()> {
        self.wait_for(task_settled(TaskKind::Write)).await?;
        self.client.write_file(file, corrected).await?;
        if wait {
            self.enter(SequencerPhase::WaitWriteDone);
            self.wait_for(task_settled(TaskKind::Write)).await?;
        }
        Ok(())
    }

    /// Combine the two exposures in the server's buffers, removing zingers.
    pub async fn dezinger_combine(&mut self, mode: u8) -> AppResult<()> {
        self.wait_for(task_settled(TaskKind::Dezinger)).await?;
        self.client.dezinger(mode).await?;
        self.wait_for(task_settled(TaskKind::Dezinger)).await?;
        Ok(())
    }

    fn enter(&mut self, phase: SequencerPhase) {
        if self.phase != phase {
            debug!("Sequencer {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    async fn wait_for<P>(&mut self, predicate: P) -> AppResult<StatusWord>
    where
        P: FnMut(&StatusWord) -> bool + Send,
    {
        match poll_until(
            &mut *self.client,
            predicate,
            self.timing.poll_interval,
            self.stop,
        )
        .await?
        {
            PollOutcome::Satisfied(status) => Ok(status),
            PollOutcome::Cancelled => Err(DaqError::Cancelled),
        }
    }
}
