//! The Bouncer - central shared state for the process.
//!
//! A dependency-injection container handed to every connection task: the
//! loaded configuration, the database handle, the live-connection registry,
//! the (hot-swappable) verb handler table, and the shutdown channel.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::db::Database;
use crate::handlers::Registry;
use crate::state::ConnectionRegistry;

/// Central shared state container.
pub struct Bouncer {
    /// Loaded configuration.
    pub config: Config,

    /// Database handle for process-wide persistence.
    pub db: Database,

    /// Index of live connections.
    pub registry: ConnectionRegistry,

    /// Verb handler table. Swapped atomically by RELOAD.
    handlers: RwLock<Arc<Registry>>,

    /// Serializes upstream lookup-then-create so a (user, network) pair can
    /// never end up with two outgoing connections.
    pub upstream_gate: tokio::sync::Mutex<()>,

    /// Broadcast channel signalling process shutdown.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl Bouncer {
    /// Build the shared state.
    pub fn new(config: Config, db: Database) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            db,
            registry: ConnectionRegistry::new(),
            handlers: RwLock::new(Arc::new(Registry::new())),
            upstream_gate: tokio::sync::Mutex::new(()),
            shutdown_tx,
        })
    }

    /// The current verb handler table.
    pub fn handlers(&self) -> Arc<Registry> {
        Arc::clone(&self.handlers.read())
    }

    /// Discard and rebuild the verb handler table (RELOAD verb).
    pub fn reload_handlers(&self) {
        *self.handlers.write() = Arc::new(Registry::new());
    }

    /// Signal every task to stop; the accept loop exits and the process
    /// follows.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
