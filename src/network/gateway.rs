//! The Gateway: accepts client connections and spawns their tasks.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::network::downstream::Downstream;
use crate::state::{Bouncer, ConKind, ConnState};

/// Listening socket plus the accept loop.
pub struct Gateway {
    listener: TcpListener,
    bnc: Arc<Bouncer>,
    /// The listener's own connection record.
    record: ConnState,
}

impl Gateway {
    /// Bind the configured listen address.
    pub async fn bind(bnc: Arc<Bouncer>) -> anyhow::Result<Self> {
        let addr = bnc.config.listen.address;
        let listener = TcpListener::bind(addr).await?;

        let mut record = ConnState::new(
            uuid::Uuid::new_v4().to_string(),
            ConKind::Listening,
            bnc.db.clone(),
        );
        record.host = addr.ip().to_string();
        record.port = addr.port();
        record.connected = true;
        record.save().await?;

        info!(address = %addr, "Listening for clients");
        Ok(Self {
            listener,
            bnc,
            record,
        })
    }

    /// Accept clients until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.bnc.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let bnc = Arc::clone(&self.bnc);
                        tokio::spawn(async move {
                            let downstream = Downstream::new(bnc, addr);
                            if let Err(e) = downstream.run(stream).await {
                                warn!(addr = %addr, error = %e, "Client task failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Stopping listener");
                    break;
                }
            }
        }

        if let Err(e) = self.record.destroy().await {
            warn!(error = %e, "Failed to remove listener record");
        }
        Ok(())
    }
}
