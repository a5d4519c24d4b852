//! Acquisition control: everything between "start" and "image on disk".
//!
//! Leaves first: [`stop`] is the cancellation signal every wait observes, [`poll`]
//! is the status polling loop, [`exposure`] the software exposure timer and
//! [`result_file`] the TIFF reader. [`sequencer`] composes them into one capture
//! cycle per frame type.

pub mod exposure;
pub mod poll;
pub mod result_file;
pub mod sequencer;
pub mod stop;
