//! Integration test common infrastructure.
//!
//! Builds an in-process bouncer over in-memory SQLite and drives the
//! dispatch state machine directly with parsed lines. Outbound traffic and
//! upstream control commands are captured on channels so tests can assert
//! on exact wire behavior without sockets.

#![allow(dead_code)]

use std::sync::Arc;

use slbnc::config::{Config, DatabaseConfig, ListenConfig, ServerConfig};
use slbnc::db::Database;
use slbnc::error::HandlerError;
use slbnc::handlers::{self, Context, MsgOrigin};
use slbnc::state::{Bouncer, ConKind, ConnState, ConnectionHandle, UpstreamCommand};
use slbnc_proto::Message;
use tokio::sync::{Mutex, mpsc};

/// An in-process bouncer instance.
pub struct TestBnc {
    pub bnc: Arc<Bouncer>,
}

impl TestBnc {
    pub async fn new() -> Self {
        let config = Config {
            server: ServerConfig::default(),
            listen: ListenConfig {
                address: "127.0.0.1:0".parse().expect("valid test address"),
            },
            database: DatabaseConfig::default(),
            seed_users: Vec::new(),
            seed_networks: Vec::new(),
        };
        let db = Database::new(":memory:").await.expect("in-memory database");
        Self {
            bnc: Bouncer::new(config, db),
        }
    }

    /// Create a user account; returns its id.
    pub async fn seed_user(&self, username: &str, password: &str) -> i64 {
        self.bnc
            .db
            .users()
            .ensure_user(username, password, false)
            .await
            .expect("seed user")
    }

    /// Create a network for a user; returns its id. The host points at a
    /// closed local port so accidental dials fail fast.
    pub async fn seed_network(&self, user_id: i64, name: &str) -> i64 {
        self.bnc
            .db
            .users()
            .ensure_network(user_id, name, "127.0.0.1", 1, false, "upnick")
            .await
            .expect("seed network")
    }

    /// Attach a simulated client connection.
    pub async fn client(&self) -> TestClient {
        let con_id = uuid::Uuid::new_v4().to_string();
        let mut state = ConnState::new(&con_id, ConKind::Incoming, self.bnc.db.clone());
        state.save().await.expect("save client record");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            con_id: con_id.clone(),
            kind: ConKind::Incoming,
            state: Arc::new(Mutex::new(state)),
            out_tx,
            ctl_tx: None,
        });
        self.bnc.registry.insert(Arc::clone(&handle));

        TestClient {
            con_id,
            handle,
            out_rx,
            bnc: Arc::clone(&self.bnc),
        }
    }

    /// Attach a simulated, already-registered upstream whose control and
    /// outbound channels the test observes.
    pub async fn fake_upstream(&self, user_id: i64, network_id: i64, nick: &str) -> FakeUpstream {
        let con_id = uuid::Uuid::new_v4().to_string();
        let mut state = ConnState::new(&con_id, ConKind::Outgoing, self.bnc.db.clone());
        state.auth_user_id = user_id;
        state.auth_network_id = network_id;
        state.nick = nick.to_string();
        state.connected = true;
        state.net_registered = true;
        state.received_motd = true;
        state.save().await.expect("save upstream record");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            con_id: con_id.clone(),
            kind: ConKind::Outgoing,
            state: Arc::new(Mutex::new(state)),
            out_tx,
            ctl_tx: Some(ctl_tx),
        });
        self.bnc.registry.insert(Arc::clone(&handle));

        FakeUpstream {
            con_id,
            handle,
            out_rx,
            ctl_rx,
        }
    }
}

/// A simulated downstream client.
pub struct TestClient {
    pub con_id: String,
    pub handle: Arc<ConnectionHandle>,
    out_rx: mpsc::UnboundedReceiver<Message>,
    bnc: Arc<Bouncer>,
}

impl TestClient {
    /// Dispatch one raw line as if it arrived on the socket.
    pub async fn dispatch(&mut self, line: &str) -> Result<(), HandlerError> {
        let msg: Message = line.parse().expect("test line parses");
        let mut state = self.handle.state.lock().await;
        let mut ctx = Context {
            bnc: &self.bnc,
            con: &mut state,
            out_tx: &self.handle.out_tx,
            origin: MsgOrigin::Socket,
        };
        handlers::process_line(&mut ctx, &msg).await
    }

    /// Everything the bouncer has sent this client, serialized.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(msg) = self.out_rx.try_recv() {
            lines.push(msg.to_string());
        }
        lines
    }

    /// Read a value out of the connection record.
    pub async fn with_state<R>(&self, f: impl FnOnce(&ConnState) -> R) -> R {
        let state = self.handle.state.lock().await;
        f(&state)
    }

    /// Mutate the connection record (test setup shortcuts).
    pub async fn with_state_mut<R>(&self, f: impl FnOnce(&mut ConnState) -> R) -> R {
        let mut state = self.handle.state.lock().await;
        f(&mut state)
    }

    /// Mark this client as authenticated and registered against a network,
    /// linked to the given upstream.
    pub async fn force_attach(&self, upstream: &FakeUpstream, user_id: i64, network_id: i64) {
        {
            let mut state = self.handle.state.lock().await;
            state.auth_user_id = user_id;
            state.auth_network_id = network_id;
            state.net_registered = true;
            state.save().await.expect("save client record");
        }
        let mut state = upstream.handle.state.lock().await;
        state
            .link_incoming(&self.con_id)
            .await
            .expect("link client");
    }
}

/// A simulated upstream whose channels the test holds.
pub struct FakeUpstream {
    pub con_id: String,
    pub handle: Arc<ConnectionHandle>,
    pub out_rx: mpsc::UnboundedReceiver<Message>,
    pub ctl_rx: mpsc::UnboundedReceiver<UpstreamCommand>,
}

impl FakeUpstream {
    /// Control commands received so far.
    pub fn drain_commands(&mut self) -> Vec<UpstreamCommand> {
        let mut commands = Vec::new();
        while let Ok(cmd) = self.ctl_rx.try_recv() {
            commands.push(cmd);
        }
        commands
    }

    pub async fn with_state_mut<R>(&self, f: impl FnOnce(&mut ConnState) -> R) -> R {
        let mut state = self.handle.state.lock().await;
        f(&mut state)
    }
}
