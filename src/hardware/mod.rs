//! Detector server communication.
//!
//! [`transport`] is the line-oriented channel, [`marccd`] the server's command set
//! on top of it, and [`mock`] an in-process simulated server for tests and dry runs.

pub mod marccd;
pub mod mock;
pub mod transport;
