//! Status word codec for the marccd server.
//!
//! `get_state` answers with one integer that packs the server state and the status of
//! its five worker tasks:
//!
//! ```text
//! bits 0..4    state field   0 idle, 1 acquire, 2 readout, 3 correct, 4 writing,
//!                            5 aborting, 6 unavailable, 7 error, 8+ busy
//! bits 4..8    acquire task  bit0 queued, bit1 executing, bit2 error, bit3 reserved
//! bits 8..12   readout task
//! bits 12..16  correct task
//! bits 16..20  write task
//! bits 20..24  dezinger task
//! ```
//!
//! Decoding happens once, at the poll boundary, into a [`StatusWord`]. Everything
//! downstream asks typed questions of it instead of shifting bits.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Status flags of one server task.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TaskStatus: u8 {
        /// A command for the task is waiting to run
        const QUEUED = 0x1;
        /// The task is running
        const EXECUTING = 0x2;
        /// The task failed
        const ERROR = 0x4;
        /// Reserved by the server
        const RESERVED = 0x8;
    }
}

impl TaskStatus {
    /// Queued or executing.
    pub const ACTIVE: TaskStatus = TaskStatus::QUEUED.union(TaskStatus::EXECUTING);

    /// Whether the task has work queued or running.
    pub fn is_active(self) -> bool {
        self.intersects(Self::ACTIVE)
    }
}

/// The five server tasks, in bitfield order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum TaskKind {
    Acquire,
    Readout,
    Correct,
    Write,
    Dezinger,
}

impl TaskKind {
    /// All tasks in bitfield order.
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Acquire,
        TaskKind::Readout,
        TaskKind::Correct,
        TaskKind::Write,
        TaskKind::Dezinger,
    ];

    /// Position of the task in the status word.
    pub fn index(self) -> usize {
        self as usize
    }

    fn shift(self) -> u32 {
        4 * (self.index() as u32 + 1)
    }
}

/// Coarse server state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverallState {
    /// Nothing happening
    Idle,
    /// Acquire task active
    Acquire,
    /// Readout task active
    Readout,
    /// Correct task active
    Correct,
    /// Write task active
    Writing,
    /// Abort in progress
    Aborting,
    /// Detector unavailable
    Unavailable,
    /// A task reported an error
    Error,
    /// Transitional state; carries the raw state field (8..=15)
    Busy(u8),
}

impl OverallState {
    /// Map the low four bits of a status word.
    pub fn from_field(field: u8) -> Self {
        match field & 0xF {
            0 => OverallState::Idle,
            1 => OverallState::Acquire,
            2 => OverallState::Readout,
            3 => OverallState::Correct,
            4 => OverallState::Writing,
            5 => OverallState::Aborting,
            6 => OverallState::Unavailable,
            7 => OverallState::Error,
            other => OverallState::Busy(other),
        }
    }
}

/// Per-task status of all five tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TaskStatusSet([TaskStatus; 5]);

impl TaskStatusSet {
    /// Status of one task.
    pub fn get(&self, task: TaskKind) -> TaskStatus {
        self.0[task.index()]
    }

    /// Iterate `(task, status)` pairs in bitfield order.
    pub fn iter(&self) -> impl Iterator<Item = (TaskKind, TaskStatus)> + '_ {
        TaskKind::ALL.iter().map(move |&task| (task, self.get(task)))
    }

    /// Whether any task has its error flag set.
    pub fn any_error(&self) -> bool {
        self.0.iter().any(|s| s.contains(TaskStatus::ERROR))
    }
}

/// A decoded `get_state` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StatusWord {
    raw: u32,
}

impl StatusWord {
    /// Decode a raw status word. Total: every integer decodes.
    pub fn decode(raw: u32) -> Self {
        Self { raw }
    }

    /// The undecoded word, unknown high bits included.
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// The low four bits as reported by the server.
    pub fn state_field(&self) -> OverallState {
        OverallState::from_field((self.raw & 0xF) as u8)
    }

    /// Status flags of one task.
    pub fn task(&self, task: TaskKind) -> TaskStatus {
        TaskStatus::from_bits_retain(((self.raw >> task.shift()) & 0xF) as u8)
    }

    /// Status flags of every task.
    pub fn tasks(&self) -> TaskStatusSet {
        TaskStatusSet(TaskKind::ALL.map(|task| self.task(task)))
    }

    /// Whether the task has work queued or running.
    pub fn is_active(&self, task: TaskKind) -> bool {
        self.task(task).is_active()
    }

    /// Whether the task is executing (queued alone does not count).
    pub fn is_executing(&self, task: TaskKind) -> bool {
        self.task(task).contains(TaskStatus::EXECUTING)
    }

    /// State field 8 and above marks a transitional state in which no command
    /// may be issued, whatever the task bits say.
    pub fn is_busy(&self) -> bool {
        (self.raw & 0xF) >= 8
    }

    /// Task has settled: not queued, not executing, and the server is not busy.
    pub fn is_settled(&self, task: TaskKind) -> bool {
        !self.is_active(task) && !self.is_busy()
    }

    /// Overall classification.
    ///
    /// Zero is idle. Otherwise the first active task in the order acquire, readout,
    /// correct, write decides, and an error flag on any task overrides everything.
    /// A non-zero word with none of those four tasks active classifies as error,
    /// whatever the state field says.
    pub fn classify(&self) -> OverallState {
        let tasks = self.tasks();
        if tasks.any_error() {
            return OverallState::Error;
        }
        if self.raw == 0 {
            return OverallState::Idle;
        }
        let priority = [
            (TaskKind::Acquire, OverallState::Acquire),
            (TaskKind::Readout, OverallState::Readout),
            (TaskKind::Correct, OverallState::Correct),
            (TaskKind::Write, OverallState::Writing),
        ];
        priority
            .iter()
            .find(|(task, _)| tasks.get(*task).is_active())
            .map(|(_, state)| *state)
            .unwrap_or(OverallState::Error)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({:?}", self.raw, self.classify())?;
        if self.raw != 0 {
            write!(f, ", field {:?}", self.state_field())?;
        }
        for (task, status) in self.tasks().iter() {
            if !status.is_empty() {
                write!(f, ", {:?}={:?}", task, status)?;
            }
        }
        write!(f, ")")
    }
}
