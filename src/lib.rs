//! slbnc - Straylight IRC Bouncer.
//!
//! A persistent intermediary that keeps long-lived sessions on IRC networks
//! while ephemeral client connections attach to, detach from, and share
//! them. When no client is attached the bouncer keeps receiving traffic,
//! tracking channel membership, and recording history; an attaching client
//! gets a synthetic view of the running session.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod network;
pub mod security;
pub mod state;
