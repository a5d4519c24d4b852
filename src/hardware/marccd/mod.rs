//! marccd detector server support
//!
//! - [`status`]: `get_state` status word codec
//! - [`protocol`]: command encoding and reply parsing
//! - [`client`]: typed client over a [`LineTransport`](crate::hardware::transport::LineTransport)

pub mod client;
pub mod protocol;
pub mod status;

pub use client::MarCcdClient;
pub use protocol::ServerCommand;
pub use status::{OverallState, StatusWord, TaskKind, TaskStatus, TaskStatusSet};
