//! Published detector status.
//!
//! The sequencer never writes status fields directly; it talks to a
//! [`StatusPublisher`]. [`DetectorStatus`] is the standard implementation: one
//! [`Observable`] per field, so any number of observers can read or subscribe while
//! a multi-second exposure is in flight.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ImageDims;
use crate::hardware::marccd::status::{OverallState, TaskStatusSet};
use crate::observable::Observable;

/// Coarse detector state as shown to operators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum DetectorState {
    #[default]
    Idle,
    Acquire,
    Readout,
    Correct,
    Saving,
    Aborting,
    Busy,
    Error,
}

impl From<OverallState> for DetectorState {
    fn from(state: OverallState) -> Self {
        match state {
            OverallState::Idle => DetectorState::Idle,
            OverallState::Acquire => DetectorState::Acquire,
            OverallState::Readout => DetectorState::Readout,
            OverallState::Correct => DetectorState::Correct,
            OverallState::Writing => DetectorState::Saving,
            OverallState::Aborting => DetectorState::Aborting,
            OverallState::Busy(_) => DetectorState::Busy,
            OverallState::Unavailable | OverallState::Error => DetectorState::Error,
        }
    }
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectorState::Idle => "Idle",
            DetectorState::Acquire => "Acquire",
            DetectorState::Readout => "Readout",
            DetectorState::Correct => "Correct",
            DetectorState::Saving => "Saving",
            DetectorState::Aborting => "Aborting",
            DetectorState::Busy => "Busy",
            DetectorState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Sink for status updates produced during acquisition.
pub trait StatusPublisher: Send + Sync {
    /// Overall detector state.
    fn set_state(&self, state: DetectorState);
    /// Operator-facing status message.
    fn set_message(&self, message: &str);
    /// Per-task status flags from the latest `get_state`.
    fn set_task_status(&self, tasks: TaskStatusSet);
    /// Exposure time left.
    fn set_time_remaining(&self, remaining: Duration);
    /// Image size reported by the server.
    fn set_image_size(&self, dims: ImageDims);
    /// Number of images published so far.
    fn set_image_counter(&self, count: u64);
}

/// Observable status surface of one detector.
///
/// Clones share the same channels.
#[derive(Clone, Debug)]
pub struct DetectorStatus {
    /// Overall state
    pub state: Observable<DetectorState>,
    /// Status message
    pub message: Observable<String>,
    /// True from an accepted start until the cycle ends
    pub acquiring: Observable<bool>,
    /// Per-task flags
    pub task_status: Observable<TaskStatusSet>,
    /// Remaining exposure time
    pub time_remaining: Observable<Duration>,
    /// Current image size
    pub image_size: Observable<ImageDims>,
    /// Images published
    pub image_counter: Observable<u64>,
    /// Last line sent to the server
    pub string_to_server: Observable<String>,
    /// Last line received from the server
    pub string_from_server: Observable<String>,
}

impl DetectorStatus {
    /// Fresh status surface: idle, nothing acquired.
    pub fn new() -> Self {
        Self {
            state: Observable::new("detector_state", DetectorState::Idle),
            message: Observable::new("status_message", String::new()),
            acquiring: Observable::new("acquire", false)
                .with_description("Acquisition in progress"),
            task_status: Observable::new("task_status", TaskStatusSet::default()),
            time_remaining: Observable::new("time_remaining", Duration::ZERO)
                .with_description("Remaining exposure time")
                .with_units("s"),
            image_size: Observable::new("image_size", ImageDims::default()),
            image_counter: Observable::new("image_counter", 0),
            string_to_server: Observable::new("string_to_server", String::new()),
            string_from_server: Observable::new("string_from_server", String::new()),
        }
    }

    /// Claim the acquisition. Returns `false` if one is already running.
    pub fn try_begin_acquire(&self) -> bool {
        self.acquiring.update(|acquiring| {
            if *acquiring {
                false
            } else {
                *acquiring = true;
                true
            }
        })
    }

    /// Release the acquisition claim.
    pub fn end_acquire(&self) {
        self.acquiring.set_if_changed(false);
    }
}

impl Default for DetectorStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher for DetectorStatus {
    fn set_state(&self, state: DetectorState) {
        self.state.set_if_changed(state);
    }

    fn set_message(&self, message: &str) {
        self.message.set_if_changed(message.to_string());
    }

    fn set_task_status(&self, tasks: TaskStatusSet) {
        self.task_status.set_if_changed(tasks);
    }

    fn set_time_remaining(&self, remaining: Duration) {
        self.time_remaining.set(remaining);
    }

    fn set_image_size(&self, dims: ImageDims) {
        self.image_size.set_if_changed(dims);
    }

    fn set_image_counter(&self, count: u64) {
        self.image_counter.set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::marccd::status::StatusWord;

    #[test]
    fn test_state_mapping() {
        assert_eq!(DetectorState::from(OverallState::Writing), DetectorState::Saving);
        assert_eq!(DetectorState::from(OverallState::Busy(9)), DetectorState::Busy);
        assert_eq!(
            DetectorState::from(OverallState::Unavailable),
            DetectorState::Error
        );
        // write error beats readout executing
        let word = StatusWord::decode(0x40200);
        assert_eq!(DetectorState::from(word.classify()), DetectorState::Error);
    }

    #[test]
    fn test_acquire_claim_is_exclusive() {
        let status = DetectorStatus::new();
        assert!(status.try_begin_acquire());
        assert!(!status.clone().try_begin_acquire());
        status.end_acquire();
        assert!(status.try_begin_acquire());
    }

    #[tokio::test]
    async fn test_publisher_notifies_subscribers() {
        let status = DetectorStatus::new();
        let mut rx = status.message.subscribe();

        status.set_message("Starting exposure");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_str(), "Starting exposure");

        status.set_image_counter(4);
        assert_eq!(status.image_counter.get(), 4);
    }
}
