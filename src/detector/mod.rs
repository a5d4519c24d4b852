//! The detector as seen by the rest of the application.
//!
//! - [`settings`]: live acquisition settings and the per-cycle snapshot
//! - [`status`]: observable status surface the worker publishes into
//! - [`sink`]: where decoded images are delivered
//! - [`messages`]: commands for the worker
//! - [`actor`]: the worker running the sequencer loop, and its handle

pub mod actor;
pub mod messages;
pub mod settings;
pub mod sink;
pub mod status;

pub use actor::{DetectorActor, DetectorHandle, DetectorInfo, DetectorReport, WorkerTiming};
pub use messages::DetectorCommand;
pub use settings::{AcquisitionSettings, SettingsStore, SharedSettings, ShutterTiming};
pub use sink::{DiscardSink, ImageSink};
pub use status::{DetectorState, DetectorStatus, StatusPublisher};
