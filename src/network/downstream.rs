//! Downstream connections: end-user clients attached to the bouncer.
//!
//! Each client runs in its own task. Inbound lines go through the dispatch
//! state machine strictly in arrival order; a line (and everything it
//! persists) completes before the next one is read. Outbound lines queue on
//! the connection's channel and are written between inbound lines.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use slbnc_proto::{IrcCodec, Message, ProtocolError};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::error::HandlerError;
use crate::handlers::{self, Context, MsgOrigin};
use crate::state::{Bouncer, ConKind, ConnState, ConnectionHandle};

/// A client connection handler.
pub struct Downstream {
    con_id: String,
    addr: SocketAddr,
    bnc: Arc<Bouncer>,
}

impl Downstream {
    pub fn new(bnc: Arc<Bouncer>, addr: SocketAddr) -> Self {
        Self {
            con_id: uuid::Uuid::new_v4().to_string(),
            addr,
            bnc,
        }
    }

    /// Run the connection lifecycle.
    #[instrument(skip(self, stream), fields(con_id = %self.con_id, addr = %self.addr), name = "downstream")]
    pub async fn run(self, stream: TcpStream) -> anyhow::Result<()> {
        info!("Client connected");

        let mut state = ConnState::new(&self.con_id, ConKind::Incoming, self.bnc.db.clone());
        state.maybe_load().await?;
        state.server_prefix = self.bnc.config.server.prefix.clone();
        state.save().await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let handle = Arc::new(ConnectionHandle {
            con_id: self.con_id.clone(),
            kind: ConKind::Incoming,
            state: Arc::new(Mutex::new(state)),
            out_tx: out_tx.clone(),
            ctl_tx: None,
        });
        self.bnc.registry.insert(Arc::clone(&handle));

        let mut framed = Framed::new(stream, IrcCodec::new());
        let mut shutdown_rx = self.bnc.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                line = framed.next() => match line {
                    Some(Ok(msg)) => {
                        let mut state = handle.state.lock().await;
                        let mut ctx = Context {
                            bnc: &self.bnc,
                            con: &mut state,
                            out_tx: &out_tx,
                            origin: MsgOrigin::Socket,
                        };
                        match handlers::process_line(&mut ctx, &msg).await {
                            Ok(()) => {}
                            Err(HandlerError::Quit) | Err(HandlerError::Gone) => break,
                            Err(HandlerError::Shutdown) => {
                                self.bnc.shutdown();
                                break;
                            }
                            Err(HandlerError::Db(e)) => {
                                // A state change that cannot be persisted must
                                // not be acknowledged; drop the connection.
                                error!(error = %e, "Persistence failed - closing connection");
                                break;
                            }
                        }
                    }
                    Some(Err(ProtocolError::InvalidMessage { string, cause })) => {
                        debug!(line = %string, error = %cause, "Unparseable client line dropped");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Client read error");
                        break;
                    }
                    None => break,
                },
                Some(msg) = out_rx.recv() => {
                    if framed.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        // Flush whatever is still queued (an ERROR line, the end of a
        // replay) before tearing the socket down.
        while let Ok(msg) = out_rx.try_recv() {
            if framed.send(msg).await.is_err() {
                break;
            }
        }

        self.cleanup(&handle).await;
        info!("Client disconnected");
        Ok(())
    }

    /// Detach from the upstream and drop the persisted record: incoming
    /// state does not outlive the socket.
    async fn cleanup(&self, handle: &Arc<ConnectionHandle>) {
        self.bnc.registry.remove(&self.con_id);

        let (user_id, network_id) = {
            let state = handle.state.lock().await;
            (state.auth_user_id, state.auth_network_id)
        };

        if user_id != 0 && network_id != 0 {
            let upstream = self
                .bnc
                .registry
                .find_users_outgoing_connection(user_id, network_id)
                .await;
            if let Some(upstream) = upstream {
                let mut state = upstream.state.lock().await;
                if let Err(e) = state.unlink_incoming(&self.con_id).await {
                    warn!(error = %e, "Failed to unlink client from upstream");
                }
            }
        }

        let state = handle.state.lock().await;
        if let Err(e) = state.destroy().await {
            warn!(error = %e, "Failed to remove connection record");
        }
    }
}
