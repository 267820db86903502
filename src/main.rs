//! slbnc - Straylight IRC Bouncer.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use slbnc::config::Config;
use slbnc::db::Database;
use slbnc::network::{Gateway, upstream};
use slbnc::state::{Bouncer, ConKind, ConnState};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `config.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before tracing, so we can use log_format)
    let config_path = resolve_config_path();

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match config.server.log_format {
        slbnc::config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        slbnc::config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = slbnc::config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(prefix = %config.server.prefix, "Starting slbnc");

    let db = Database::new(&config.database.path).await?;

    seed_accounts(&db, &config).await?;

    let bnc = Bouncer::new(config, db);

    // Graceful shutdown on SIGINT/SIGTERM.
    {
        let shutdown_tx = bnc.shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - initiating graceful shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM - initiating graceful shutdown"),
            }

            let _ = shutdown_tx.send(());
        });
    }

    restore_upstreams(&bnc).await?;

    let gateway = Gateway::bind(Arc::clone(&bnc)).await?;
    gateway.run().await?;

    info!("Listener stopped, waiting for tasks to finish...");
    // Give connection tasks a moment to flush and close.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    Ok(())
}

/// Apply `[[seed_user]]` and `[[seed_network]]` blocks idempotently.
async fn seed_accounts(db: &Database, config: &Config) -> anyhow::Result<()> {
    let users = db.users();

    for seed in &config.seed_users {
        let id = users
            .ensure_user(&seed.username, &seed.password, seed.admin)
            .await?;
        info!(username = %seed.username, user_id = %id, "Seed user ready");
    }

    for seed in &config.seed_networks {
        let Some(owner) = config
            .seed_users
            .iter()
            .find(|u| u.username == seed.user)
        else {
            continue;
        };
        // Validation guarantees the owner exists; re-resolve its id.
        let owner_id = users.ensure_user(&owner.username, &owner.password, owner.admin).await?;
        let nick = if seed.nick.is_empty() {
            owner.username.clone()
        } else {
            seed.nick.clone()
        };
        let id = users
            .ensure_network(owner_id, &seed.name, &seed.host, seed.port, seed.tls, &nick)
            .await?;
        info!(network = %seed.name, network_id = %id, "Seed network ready");
    }

    Ok(())
}

/// Bring persisted upstream sessions back after a restart.
///
/// Incoming records are purged first: their sockets did not survive the
/// process bounce, and neither did the client links recorded on upstreams.
async fn restore_upstreams(bnc: &Arc<Bouncer>) -> anyhow::Result<()> {
    let removed = bnc
        .db
        .connections()
        .delete_all_of_kind(ConKind::Incoming.as_str())
        .await?;
    if removed > 0 {
        info!(count = removed, "Purged stale client records");
    }
    let removed = bnc
        .db
        .connections()
        .delete_all_of_kind(ConKind::Listening.as_str())
        .await?;
    if removed > 0 {
        info!(count = removed, "Purged stale listener records");
    }

    let rows = bnc
        .db
        .connections()
        .all_of_kind(ConKind::Outgoing.as_str())
        .await?;

    for row in rows {
        let was_connected = row.connected;
        let conid = row.conid.clone();

        let mut state = ConnState::new(&conid, ConKind::Outgoing, bnc.db.clone());
        if let Err(e) = state.load().await {
            warn!(con_id = %conid, error = %e, "Skipping unloadable upstream record");
            continue;
        }

        state.linked_incoming.clear();
        state.connected = false;
        state.net_registered = false;
        state.received_motd = false;
        state.save().await?;

        let network = state.auth_network_name.clone();
        let handle = upstream::spawn_upstream(Arc::clone(bnc), state);
        info!(con_id = %conid, network = %network, reconnect = %was_connected, "Upstream restored");

        if was_connected {
            handle.control(slbnc::state::UpstreamCommand::Open);
        }
    }

    Ok(())
}
