//! Networking: the client listener and upstream sessions.

pub mod downstream;
pub mod gateway;
pub mod upstream;

pub use gateway::Gateway;
