//! Acquisition driver for MAR-CCD area detectors.
//!
//! The detector is operated through the marccd server: a line-oriented text protocol
//! over a persistent TCP connection, plus a TIFF file the server writes after each
//! readout. This crate sequences the server through complete capture cycles,
//! decodes its status word, runs the software exposure timer, reads the result file
//! back and publishes one 16-bit image per cycle.
//!
//! - [`hardware`]: transport, server protocol and status codec, simulated server
//! - [`acquisition`]: stop signal, polling, exposure timer, result file reader, sequencer
//! - [`detector`]: the worker that runs the sequencer loop, its handle and status surface
//! - [`config`], [`error`], [`core`], [`observable`]: shared infrastructure

pub mod acquisition;
pub mod config;
pub mod core;
pub mod detector;
pub mod error;
pub mod hardware;
pub mod observable;
