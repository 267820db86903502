//! State management module.
//!
//! Contains the durable per-connection record, the live-connection registry,
//! and the Bouncer (shared process state).

mod bouncer;
mod buffer;
mod connection;
mod registry;

pub use bouncer::Bouncer;
pub use buffer::Buffer;
pub use connection::{ConKind, ConnState, RegState, SaslCreds};
pub use connection::{TEMP_CAPPING, TEMP_REG_QUEUE, TEMP_REG_STATE};
pub use registry::{ConnectionHandle, ConnectionRegistry, UpstreamCommand};
