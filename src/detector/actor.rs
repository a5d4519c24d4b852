//! Detector worker and its handle.
//!
//! The worker is a single tokio task that owns the server connection and runs the
//! sequencer loop: wait for a command, run one capture cycle, publish the result,
//! return to idle. Cycles never overlap because the worker handles one command at a
//! time. A failed cycle is reported through the status surface and the worker keeps
//! serving commands.
//!
//! Stop requests bypass the command queue. [`DetectorHandle::stop`] sets the shared
//! [`StopSignal`] directly so an in-flight exposure or poll sees it at its next
//! tick; the queued `Stop` only matters when nothing was running to consume it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::acquisition::result_file::ResultFileReader;
use crate::acquisition::sequencer::{AcquisitionSequencer, SequencerTiming};
use crate::acquisition::stop::StopSignal;
use crate::config::{DetectorConfig, TimingConfig};
use crate::core::{DecodedImage, FrameAllocator, HeapAllocator, ImageDims};
use crate::error::{AppResult, DaqError};
use crate::hardware::marccd::client::MarCcdClient;
use crate::hardware::marccd::status::StatusWord;
use crate::hardware::transport::LineTransport;

use super::messages::DetectorCommand;
use super::settings::{AcquisitionSettings, SettingsStore, SharedSettings};
use super::sink::ImageSink;
use super::status::{DetectorState, DetectorStatus, StatusPublisher};

const IDLE_MESSAGE: &str = "Waiting for acquire command";
const ABORTED_MESSAGE: &str = "Acquisition aborted";

/// Capacity of the worker's command queue.
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Worker intervals taken from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerTiming {
    /// Sleep between status polls
    pub poll_interval: Duration,
    /// Exposure timer wake interval
    pub exposure_tick: Duration,
    /// Delay between result file read attempts
    pub file_read_delay: Duration,
}

impl WorkerTiming {
    /// Intervals from the `[timing]` section.
    pub fn from_config(timing: &TimingConfig) -> Self {
        Self {
            poll_interval: timing.poll_interval(),
            exposure_tick: timing.exposure_tick(),
            file_read_delay: timing.file_read_delay(),
        }
    }
}

/// Static detector identification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectorInfo {
    /// Manufacturer name
    pub manufacturer: String,
    /// Model name
    pub model: String,
    /// Full sensor size
    pub max_size: ImageDims,
}

impl DetectorInfo {
    /// Identification from the `[detector]` section.
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            manufacturer: config.detector.manufacturer.clone(),
            model: config.detector.model.clone(),
            max_size: ImageDims::new(config.detector.max_size_x, config.detector.max_size_y),
        }
    }
}

/// Point-in-time summary for operators.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub struct DetectorReport {
    pub info: DetectorInfo,
    pub state: DetectorState,
    pub message: String,
    pub image_size: ImageDims,
    pub image_counter: u64,
    pub acquiring: bool,
}

impl fmt::Display for DetectorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MAR-CCD detector")?;
        writeln!(f, "  Manufacturer: {}", self.info.manufacturer)?;
        writeln!(f, "  Model:        {}", self.info.model)?;
        writeln!(f, "  Max size:     {}", self.info.max_size)?;
        writeln!(f, "  Image size:   {}", self.image_size)?;
        writeln!(f, "  State:        {}", self.state)?;
        writeln!(f, "  Acquiring:    {}", self.acquiring)?;
        writeln!(f, "  Images:       {}", self.image_counter)?;
        write!(f, "  Message:      {}", self.message)
    }
}

/// Single worker that owns the server connection.
pub struct DetectorActor {
    client: MarCcdClient,
    settings: Arc<dyn SettingsStore>,
    status: Arc<DetectorStatus>,
    stop: Arc<StopSignal>,
    sink: Arc<dyn ImageSink>,
    allocator: Arc<dyn FrameAllocator>,
    timing: WorkerTiming,
    image_counter: u64,
}

impl DetectorActor {
    /// Wire a worker to its collaborators.
    pub fn new(
        client: MarCcdClient,
        settings: Arc<dyn SettingsStore>,
        status: Arc<DetectorStatus>,
        stop: Arc<StopSignal>,
        sink: Arc<dyn ImageSink>,
        allocator: Arc<dyn FrameAllocator>,
        timing: WorkerTiming,
    ) -> Self {
        Self {
            client,
            settings,
            status,
            stop,
            sink,
            allocator,
            timing,
            image_counter: 0,
        }
    }

    /// Runs the worker loop, processing commands until shutdown
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<DetectorCommand>) {
        info!("Detector worker started");
        match self.client.get_state().await {
            Ok(status) => info!("Detector server state {}", status),
            Err(e) => warn!("Could not read detector server state: {}", e),
        }
        self.status.set_message(IDLE_MESSAGE);

        while let Some(command) = command_rx.recv().await {
            match command {
                DetectorCommand::Start => self.acquire().await,

                DetectorCommand::Stop => self.stop_while_idle().await,

                DetectorCommand::SetBinning { x, y, response } => {
                    let result = self.set_binning(x, y).await;
                    let _ = response.send(result);
                }

                DetectorCommand::WriteFile { response } => {
                    let result = self.write_file().await;
                    let _ = response.send(result);
                }

                DetectorCommand::RefreshState { response } => {
                    let result = self.client.get_state().await;
                    let _ = response.send(result);
                }

                DetectorCommand::Shutdown { response } => {
                    info!("Shutdown command received");
                    let _ = response.send(());
                    break;
                }
            }
        }

        info!("Detector worker shutting down");
    }

    /// One pass of the sequencer loop, start to idle.
    async fn acquire(&mut self) {
        match self.run_cycle().await {
            Ok(Some(image)) => {
                let id = image.id;
                match self.sink.publish(image).await {
                    Ok(()) => info!("Published image {}", id),
                    Err(e) => warn!("Image {} dropped: {}", id, e),
                }
                self.status.set_state(DetectorState::Idle);
                self.status.set_message(IDLE_MESSAGE);
                self.discard_late_stop();
            }
            Ok(None) => {
                self.status.set_state(DetectorState::Idle);
                self.discard_late_stop();
            }
            Err(DaqError::Cancelled) => {
                info!("Acquisition aborted");
                if let Err(e) = self.client.abort().await {
                    error!("Failed to abort detector server: {}", e);
                }
                self.status.set_state(DetectorState::Idle);
                self.status.set_message(ABORTED_MESSAGE);
            }
            Err(err) => {
                error!("Acquisition failed: {}", err);
                // leave no task queued behind the failure
                if let Err(e) = self.client.abort().await {
                    warn!("Abort after failed acquisition not sent: {}", e);
                }
                self.status.set_state(DetectorState::Error);
                self.status.set_message(&err.to_string());
            }
        }
        self.status.set_time_remaining(Duration::ZERO);
        self.status.end_acquire();
    }

    #[instrument(skip(self))]
    async fn run_cycle(&mut self) -> AppResult<Option<DecodedImage>> {
        let request = self.settings.frame_request();
        let file = if request.auto_save {
            Some(self.settings.next_file_name()?)
        } else {
            None
        };
        let shutter = self.settings.shutter_timing();
        let timing = SequencerTiming {
            poll_interval: self.timing.poll_interval,
            exposure_tick: self.timing.exposure_tick,
            shutter_open_delay: shutter.open_delay,
            shutter_close_delay: shutter.close_delay,
        };

        self.status.set_state(DetectorState::Acquire);
        let completed = AcquisitionSequencer::new(
            &mut self.client,
            &self.stop,
            self.status.as_ref(),
            timing,
        )
        .run(&request, file)
        .await?;

        let dims = self.client.get_size().await?;
        let outcome = completed.into_outcome(dims);
        let mut buffer = self.allocator.alloc(outcome.image_dims);

        let Some(path) = outcome.result_path else {
            warn!(
                "Frame left in server buffer {}: auto-save is off, nothing to read",
                outcome.buffer_number
            );
            self.status
                .set_message("Frame acquired, auto-save off, no image read");
            return Ok(None);
        };

        self.status
            .set_message(&format!("Reading TIFF file {}", path.display()));
        ResultFileReader::new(self.settings.tiff_timeout(), self.timing.file_read_delay)
            .read(&path, outcome.acquisition_start, &mut buffer, &self.stop)
            .await?;

        self.image_counter += 1;
        self.status.set_image_counter(self.image_counter);
        Ok(Some(buffer.into_image(
            self.image_counter,
            outcome.acquisition_start,
        )))
    }

    /// A stop that lands after the last wait of a completed cycle has nothing left
    /// to cancel. It must not reach the queued `Stop` and abort an idle server.
    fn discard_late_stop(&self) {
        if self.stop.try_consume() {
            debug!("Stop arrived after the frame completed, ignored");
        }
    }

    async fn stop_while_idle(&mut self) {
        // A running cycle consumes the signal itself
        if !self.stop.try_consume() {
            return;
        }
        info!("Stop while idle, aborting server");
        if let Err(e) = self.client.abort().await {
            error!("Failed to abort detector server: {}", e);
        }
        self.status.set_message(ABORTED_MESSAGE);
        self.status.end_acquire();
    }

    async fn set_binning(&mut self, x: u32, y: u32) -> AppResult<()> {
        if x == 0 || y == 0 {
            return Err(DaqError::Configuration(format!(
                "binning must be at least 1, got {}x{}",
                x, y
            )));
        }
        self.settings.set_binning(x, y);
        self.client.set_bin(x, y).await?;
        let dims = self.client.get_size().await?;
        debug!("Binning {}x{}, image size now {}", x, y, dims);
        Ok(())
    }

    async fn write_file(&mut self) -> AppResult<PathBuf> {
        let request = self.settings.frame_request();
        let path = self.settings.next_file_name()?;
        let timing = SequencerTiming {
            poll_interval: self.timing.poll_interval,
            exposure_tick: self.timing.exposure_tick,
            ..SequencerTiming::default()
        };

        self.status.set_state(DetectorState::Saving);
        let result = AcquisitionSequencer::new(
            &mut self.client,
            &self.stop,
            self.status.as_ref(),
            timing,
        )
        .save_file(&path, request.corrected_on_write, true)
        .await;
        self.status.set_state(DetectorState::Idle);

        result.map(|()| {
            info!("Wrote {}", path.display());
            path
        })
    }
}

/// Cheap, cloneable front end to a running [`DetectorActor`].
#[derive(Clone)]
pub struct DetectorHandle {
    command_tx: mpsc::Sender<DetectorCommand>,
    status: Arc<DetectorStatus>,
    settings: Arc<SharedSettings>,
    stop: Arc<StopSignal>,
    info: DetectorInfo,
}

impl DetectorHandle {
    /// Spawn a worker for `config` over an established transport.
    ///
    /// Every protocol line is mirrored into the returned handle's status surface.
    pub fn spawn(
        config: &DetectorConfig,
        transport: LineTransport,
        sink: Arc<dyn ImageSink>,
    ) -> (Self, JoinHandle<()>) {
        let status = Arc::new(DetectorStatus::new());
        let transport = transport.with_mirrors(
            status.string_to_server.clone(),
            status.string_from_server.clone(),
        );
        let settings = Arc::new(SharedSettings::new(AcquisitionSettings::from_config(
            config,
        )));
        let stop = Arc::new(StopSignal::new());

        let client = MarCcdClient::new(transport, status.clone());
        let actor = DetectorActor::new(
            client,
            settings.clone(),
            status.clone(),
            stop.clone(),
            sink,
            Arc::new(HeapAllocator),
            WorkerTiming::from_config(&config.timing),
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(actor.run(command_rx));

        let handle = Self {
            command_tx,
            status,
            settings,
            stop,
            info: DetectorInfo::from_config(config),
        };
        (handle, task)
    }

    /// Request one acquisition.
    ///
    /// Returns `false`, and does nothing, when an acquisition is already running.
    pub async fn start(&self) -> AppResult<bool> {
        if !self.status.try_begin_acquire() {
            warn!("Start ignored, acquisition already in progress");
            return Ok(false);
        }
        self.stop.try_consume();
        if self.command_tx.send(DetectorCommand::Start).await.is_err() {
            self.status.end_acquire();
            return Err(DaqError::ActorStopped);
        }
        Ok(true)
    }

    /// Request a stop. Never blocks.
    pub fn stop(&self) {
        self.stop.trigger();
        if let Err(e) = self.command_tx.try_send(DetectorCommand::Stop) {
            debug!("Stop not queued ({}), signal is set", e);
        }
    }

    /// Change binning.
    pub async fn set_binning(&self, x: u32, y: u32) -> AppResult<()> {
        let (command, response) = DetectorCommand::set_binning(x, y);
        self.request(command, response).await?
    }

    /// Write the current frame to the next file name.
    pub async fn write_file(&self) -> AppResult<PathBuf> {
        let (command, response) = DetectorCommand::write_file();
        self.request(command, response).await?
    }

    /// Read the server state now.
    pub async fn refresh_state(&self) -> AppResult<StatusWord> {
        let (command, response) = DetectorCommand::refresh_state();
        self.request(command, response).await?
    }

    /// Stop the worker after the current command.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (command, response) = DetectorCommand::shutdown();
        self.request(command, response).await
    }

    /// Wait until no acquisition is running.
    pub async fn wait_idle(&self) -> AppResult<()> {
        let mut acquiring = self.status.acquiring.subscribe();
        acquiring
            .wait_for(|running| !*running)
            .await
            .map(|_| ())
            .map_err(|_| DaqError::ActorStopped)
    }

    /// Snapshot for operators. Never waits for the worker.
    pub fn report(&self) -> DetectorReport {
        DetectorReport {
            info: self.info.clone(),
            state: self.status.state.get(),
            message: self.status.message.get(),
            image_size: self.status.image_size.get(),
            image_counter: self.status.image_counter.get(),
            acquiring: self.status.acquiring.get(),
        }
    }

    /// Observable status surface.
    pub fn status(&self) -> &Arc<DetectorStatus> {
        &self.status
    }

    /// Live acquisition settings.
    pub fn settings(&self) -> &Arc<SharedSettings> {
        &self.settings
    }

    async fn request<T>(
        &self,
        command: DetectorCommand,
        response: tokio::sync::oneshot::Receiver<T>,
    ) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DaqError::ActorStopped)?;
        response.await.map_err(|_| DaqError::ActorStopped)
    }
}
