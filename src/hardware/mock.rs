//! Simulated marccd server
//!
//! An in-process stand-in for the detector server, reachable through a
//! `tokio::io::duplex` pipe. It answers `get_state` and `get_size`, accepts every
//! other command silently, and advances its task model one step per `get_state`
//! poll, so timing in tests depends on poll counts rather than wall-clock time.
//!
//! # Task model
//!
//! - `start`: acquire is queued for one poll, then executes until the next readout
//! - `readout,b[,f]`: readout executes for `task_polls` polls; with a file, the write
//!   task then executes for `task_polls` polls and writes a 16-bit TIFF at the end
//! - `writefile,f,c`: write executes for `task_polls` polls, then the file appears
//! - `dezinger,m`: dezinger executes for `task_polls` polls
//! - `abort`: every task returns to idle and pending files are dropped
//!
//! Commands for a task that is still queued or executing are recorded as protocol
//! violations instead of failing, so tests can assert there were none.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::{debug, warn};

use crate::core::ImageDims;
use crate::hardware::marccd::status::{TaskKind, TaskStatus};

/// Polls a simulated task stays executing by default.
pub const DEFAULT_TASK_POLLS: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    Queued,
    Executing { polls_left: u32 },
    /// Acquire integrates until the readout that ends it
    Integrating,
}

impl Stage {
    fn flags(self) -> TaskStatus {
        match self {
            Stage::Idle => TaskStatus::empty(),
            Stage::Queued => TaskStatus::QUEUED,
            Stage::Executing { .. } | Stage::Integrating => TaskStatus::EXECUTING,
        }
    }

    fn is_idle(self) -> bool {
        self == Stage::Idle
    }

    /// Count down one poll. Returns true when the stage just finished.
    fn tick(&mut self) -> bool {
        if let Stage::Executing { polls_left } = self {
            if *polls_left <= 1 {
                *self = Stage::Idle;
                return true;
            }
            *polls_left -= 1;
        }
        false
    }
}

#[derive(Debug)]
struct ServerModel {
    full_size: ImageDims,
    bin: (u32, u32),
    task_polls: u32,
    busy_polls: u32,
    busy_left: u32,
    acquire: Stage,
    readout: Stage,
    write: Stage,
    dezinger: Stage,
    readout_file: Option<PathBuf>,
    pending_write: Option<PathBuf>,
    shutter_open: bool,
    responsive: bool,
    frames_written: u32,
    files: Vec<PathBuf>,
    log: Vec<String>,
    violations: Vec<String>,
}

impl ServerModel {
    fn new(full_size: ImageDims) -> Self {
        Self {
            full_size,
            bin: (1, 1),
            task_polls: DEFAULT_TASK_POLLS,
            busy_polls: 0,
            busy_left: 0,
            acquire: Stage::Idle,
            readout: Stage::Idle,
            write: Stage::Idle,
            dezinger: Stage::Idle,
            readout_file: None,
            pending_write: None,
            shutter_open: false,
            responsive: true,
            frames_written: 0,
            files: Vec::new(),
            log: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn image_size(&self) -> ImageDims {
        ImageDims::new(
            self.full_size.width / self.bin.0,
            self.full_size.height / self.bin.1,
        )
    }

    fn stage(&self, task: TaskKind) -> Stage {
        match task {
            TaskKind::Acquire => self.acquire,
            TaskKind::Readout => self.readout,
            TaskKind::Correct => Stage::Idle,
            TaskKind::Write => self.write,
            TaskKind::Dezinger => self.dezinger,
        }
    }

    fn status_word(&self) -> u32 {
        let mut word = 0u32;
        for task in TaskKind::ALL {
            word |= u32::from(self.stage(task).flags().bits()) << (4 * (task.index() + 1));
        }
        let field = if self.busy_left > 0 {
            8
        } else if !self.acquire.is_idle() {
            1
        } else if !self.readout.is_idle() {
            2
        } else if !self.write.is_idle() {
            4
        } else {
            0
        };
        word | field
    }

    /// Handle one request line; returns the reply, if the command has one.
    fn handle(&mut self, line: &str) -> Option<String> {
        self.log.push(line.to_string());
        let mut parts = line.split(',');
        let command = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        if !self.responsive && matches!(command, "get_state" | "get_size") {
            debug!("Simulated server ignoring '{}'", line);
            return None;
        }

        match command {
            "get_state" => {
                let word = self.status_word();
                self.advance();
                return Some(word.to_string());
            }
            "get_size" => {
                let dims = self.image_size();
                return Some(format!("{},{}", dims.width, dims.height));
            }
            "start" => {
                self.require_idle(TaskKind::Acquire, line);
                self.acquire = Stage::Queued;
            }
            "abort" => {
                self.acquire = Stage::Idle;
                self.readout = Stage::Idle;
                self.write = Stage::Idle;
                self.dezinger = Stage::Idle;
                self.readout_file = None;
                self.pending_write = None;
            }
            "shutter" => self.shutter_open = args.first() == Some(&"1"),
            "set_bin" => match (parse_arg(&args, 0), parse_arg(&args, 1)) {
                (Some(x), Some(y)) if x > 0 && y > 0 => self.bin = (x, y),
                _ => self.violations.push(format!("bad binning: {}", line)),
            },
            "readout" => {
                self.require_idle(TaskKind::Readout, line);
                self.acquire = Stage::Idle;
                self.readout = self.executing();
                self.readout_file = args.get(1).map(PathBuf::from);
            }
            "writefile" => {
                self.require_idle(TaskKind::Write, line);
                self.write = self.executing();
                self.pending_write = args.first().map(PathBuf::from);
            }
            "dezinger" => {
                self.require_idle(TaskKind::Dezinger, line);
                self.dezinger = self.executing();
            }
            _ => self.violations.push(format!("unknown command: {}", line)),
        }
        self.busy_left = self.busy_polls;
        None
    }

    fn executing(&self) -> Stage {
        Stage::Executing {
            polls_left: self.task_polls,
        }
    }

    fn require_idle(&mut self, task: TaskKind, line: &str) {
        if !self.stage(task).is_idle() || self.busy_left > 0 {
            self.violations
                .push(format!("'{}' sent while {:?} was busy", line, task));
        }
    }

    fn advance(&mut self) {
        if self.busy_left > 0 {
            self.busy_left -= 1;
        }
        if self.acquire == Stage::Queued {
            self.acquire = Stage::Integrating;
        }
        if self.readout.tick() {
            if let Some(file) = self.readout_file.take() {
                self.write = self.executing();
                self.pending_write = Some(file);
            }
        }
        if self.write.tick() {
            if let Some(file) = self.pending_write.take() {
                self.write_frame(&file);
            }
        }
        self.dezinger.tick();
    }

    fn write_frame(&mut self, path: &Path) {
        let dims = self.image_size();
        let pixels = test_pattern(dims, self.frames_written);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Simulated server cannot create {}: {}", parent.display(), e);
            }
        }
        let saved = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(
            dims.width,
            dims.height,
            pixels,
        )
        .map(|frame| frame.save(path));
        match saved {
            Some(Ok(())) => {
                debug!("Simulated server wrote {}", path.display());
                self.frames_written += 1;
                self.files.push(path.to_path_buf());
            }
            Some(Err(e)) => self
                .violations
                .push(format!("cannot write {}: {}", path.display(), e)),
            None => self
                .violations
                .push(format!("bad frame size {}", dims)),
        }
    }
}

fn parse_arg(args: &[&str], index: usize) -> Option<u32> {
    args.get(index).and_then(|a| a.trim().parse().ok())
}

/// Pixel pattern of the `frame`-th file the simulated server writes.
pub fn test_pattern(dims: ImageDims, frame: u32) -> Vec<u16> {
    let offset = (frame % 1000) as u16;
    (0..dims.pixel_count())
        .map(|i| {
            let x = (i % dims.width.max(1) as usize) as u16;
            let y = (i / dims.width.max(1) as usize) as u16;
            x.wrapping_add(y.wrapping_mul(3)).wrapping_add(offset)
        })
        .collect()
}

/// Simulated detector server.
///
/// Clones share the same server state.
#[derive(Clone, Debug)]
pub struct MockMarServer {
    model: Arc<Mutex<ServerModel>>,
}

impl MockMarServer {
    /// Server for a detector with the given unbinned size.
    pub fn new(full_size: ImageDims) -> Self {
        Self {
            model: Arc::new(Mutex::new(ServerModel::new(full_size))),
        }
    }

    /// Polls each simulated task stays executing.
    pub fn with_task_polls(self, polls: u32) -> Self {
        self.model.lock().task_polls = polls.max(1);
        self
    }

    /// Report the busy state for this many polls after every command.
    pub fn with_busy_polls(self, polls: u32) -> Self {
        self.model.lock().busy_polls = polls;
        self
    }

    /// Open a connection to the server. Each call serves a new pipe.
    pub fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(Self::serve(self.model.clone(), server));
        client
    }

    async fn serve(model: Arc<Mutex<ServerModel>>, stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = model.lock().handle(line.trim());
            if let Some(reply) = reply {
                if writer
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        debug!("Simulated server connection closed");
    }

    /// Stop answering `get_state` and `get_size` (`false`) or answer again (`true`).
    ///
    /// Ignored queries do not advance the task model.
    pub fn set_responsive(&self, responsive: bool) {
        self.model.lock().responsive = responsive;
    }

    /// Every command received, in order, replies excluded.
    pub fn commands(&self) -> Vec<String> {
        self.model.lock().log.clone()
    }

    /// Received commands other than `get_state` polls.
    pub fn actions(&self) -> Vec<String> {
        self.model
            .lock()
            .log
            .iter()
            .filter(|line| line.as_str() != "get_state")
            .cloned()
            .collect()
    }

    /// Commands that arrived while their task was busy, or were malformed.
    pub fn violations(&self) -> Vec<String> {
        self.model.lock().violations.clone()
    }

    /// Files written so far.
    pub fn files(&self) -> Vec<PathBuf> {
        self.model.lock().files.clone()
    }

    /// Whether the shutter is currently open.
    pub fn shutter_open(&self) -> bool {
        self.model.lock().shutter_open
    }

    /// Current binning.
    pub fn binning(&self) -> (u32, u32) {
        self.model.lock().bin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::marccd::status::StatusWord;

    fn poll(model: &mut ServerModel) -> StatusWord {
        StatusWord::decode(model.handle("get_state").unwrap().parse().unwrap())
    }

    #[test]
    fn test_unresponsive_server_ignores_queries() {
        let mut model = ServerModel::new(ImageDims::new(8, 8));
        model.handle("start");
        model.responsive = false;
        assert!(model.handle("get_state").is_none());
        assert!(model.handle("get_size").is_none());
        assert_eq!(model.acquire, Stage::Queued);

        model.responsive = true;
        assert_eq!(poll(&mut model).task(TaskKind::Acquire), TaskStatus::QUEUED);
    }

    #[test]
    fn test_start_queues_then_integrates() {
        let mut model = ServerModel::new(ImageDims::new(64, 64));
        assert_eq!(poll(&mut model).raw(), 0);

        assert!(model.handle("start").is_none());
        assert_eq!(poll(&mut model).task(TaskKind::Acquire), TaskStatus::QUEUED);
        assert!(poll(&mut model).is_executing(TaskKind::Acquire));
        assert!(poll(&mut model).is_executing(TaskKind::Acquire));
    }

    #[test]
    fn test_readout_then_write_produces_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a_001.tif");
        let mut model = ServerModel::new(ImageDims::new(8, 4));

        model.handle("start");
        poll(&mut model);
        model.handle(&format!("readout,0,{}", file.display()));

        assert!(poll(&mut model).is_executing(TaskKind::Readout));
        assert!(poll(&mut model).is_executing(TaskKind::Readout));
        assert!(poll(&mut model).is_executing(TaskKind::Write));
        assert!(poll(&mut model).is_executing(TaskKind::Write));
        assert_eq!(poll(&mut model).raw(), 0);

        assert!(file.exists());
        assert!(model.violations.is_empty());
    }

    #[test]
    fn test_command_for_busy_task_is_a_violation() {
        let mut model = ServerModel::new(ImageDims::new(8, 8));
        model.handle("dezinger,1");
        model.handle("dezinger,1");
        assert_eq!(model.violations.len(), 1);
    }

    #[test]
    fn test_binning_and_size() {
        let mut model = ServerModel::new(ImageDims::new(2048, 2048));
        model.handle("set_bin,2,4");
        assert_eq!(model.handle("get_size").unwrap(), "1024,512");
    }

    #[test]
    fn test_abort_clears_everything() {
        let mut model = ServerModel::new(ImageDims::new(8, 8));
        model.handle("start");
        model.handle("dezinger,0");
        model.handle("abort");
        assert_eq!(poll(&mut model).raw(), 0);
    }

    #[test]
    fn test_busy_polls_report_state_eight() {
        let mut model = ServerModel::new(ImageDims::new(8, 8));
        model.busy_polls = 2;
        model.handle("start");
        assert!(poll(&mut model).is_busy());
        assert!(poll(&mut model).is_busy());
        assert!(!poll(&mut model).is_busy());
    }
}
