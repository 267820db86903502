//! Process-wide index of live connections.
//!
//! Cross-connection references are ids resolved here at use sites, never
//! direct references, so the downstream→upstream and upstream→downstream-set
//! graph stays cycle-free. Lookups are point-in-time: a just-removed entry
//! reads as absent and callers tolerate that.
//!
//! # Lock order
//!
//! A task may lock an upstream record while holding a downstream record,
//! never the reverse. Code running on behalf of an upstream snapshots the
//! upstream state and releases it before touching any downstream record.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use slbnc_proto::Message;
use tokio::sync::{Mutex, mpsc};

use crate::state::{ConKind, ConnState};

/// Control messages for an upstream session task.
#[derive(Debug, Clone)]
pub enum UpstreamCommand {
    /// Send a line to the IRC network verbatim.
    Forward(Message),
    /// Dial if not connected.
    Open,
    /// Drop the transport.
    Close,
    /// Remove a buffer, PARTing first when it is a joined channel.
    DelBuffer { name: String },
}

/// A live connection as seen by the rest of the process.
pub struct ConnectionHandle {
    pub con_id: String,
    pub kind: ConKind,
    pub state: Arc<Mutex<ConnState>>,
    /// Lines queued for this connection's socket.
    pub out_tx: mpsc::UnboundedSender<Message>,
    /// Present on outgoing handles only.
    pub ctl_tx: Option<mpsc::UnboundedSender<UpstreamCommand>>,
}

impl ConnectionHandle {
    /// Queue a line for this connection's socket.
    ///
    /// A send error means the connection task is gone; callers treat that
    /// the same as an absent registry entry.
    pub fn send(&self, msg: Message) -> bool {
        self.out_tx.send(msg).is_ok()
    }

    /// Queue a control command (outgoing handles only).
    pub fn control(&self, cmd: UpstreamCommand) -> bool {
        match &self.ctl_tx {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

/// Index of live connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    cons: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.cons.insert(handle.con_id.clone(), handle);
    }

    pub fn remove(&self, con_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.cons.remove(con_id).map(|(_, handle)| handle)
    }

    pub fn get(&self, con_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.cons.get(con_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Find the one outgoing upstream for a (user, network) pair.
    ///
    /// At most one such connection exists at any time; the binder checks
    /// here before creating another.
    pub async fn find_users_outgoing_connection(
        &self,
        user_id: i64,
        network_id: i64,
    ) -> Option<Arc<ConnectionHandle>> {
        // Collect candidates first: dashmap guards must not be held across
        // the state-lock await.
        let candidates: Vec<Arc<ConnectionHandle>> = self
            .cons
            .iter()
            .filter(|entry| entry.value().kind == ConKind::Outgoing)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for handle in candidates {
            let state = handle.state.lock().await;
            if state.auth_user_id == user_id && state.auth_network_id == network_id {
                drop(state);
                return Some(handle);
            }
        }
        None
    }

    /// Deliver a line to every linked client except `exclude`.
    pub fn send_to_linked(
        &self,
        linked: &HashSet<String>,
        exclude: Option<&str>,
        msg: &Message,
    ) {
        for con_id in linked {
            if Some(con_id.as_str()) == exclude {
                continue;
            }
            if let Some(handle) = self.get(con_id) {
                handle.send(msg.clone());
            }
        }
    }
}
