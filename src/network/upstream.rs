//! Upstream sessions: the bouncer's own connections to IRC networks.
//!
//! Each upstream runs in its own task for the lifetime of the record,
//! connected or not. Everything that mutates upstream state arrives on the
//! task's control channel; sibling downstreams never touch the record
//! directly except for the linked-client set.
//!
//! The task captures the server's registration burst (001 through
//! end-of-MOTD) and its ISUPPORT tokens so that clients attaching later can
//! be handed a faithful synthetic registration.

use std::sync::Arc;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use slbnc_proto::{IrcCodec, Message, Prefix, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::db::{DbError, NetworkRecord};
use crate::error::HandlerError;
use crate::handlers::Context;
use crate::state::{Buffer, ConKind, ConnState, ConnectionHandle, UpstreamCommand};
use crate::state::Bouncer;

/// Capabilities requested from every upstream. `sasl` is added when the
/// network has SASL credentials.
const WANTED_CAPS: &[&str] = &["server-time", "message-tags", "multi-prefix"];

/// Temp-scratch key accumulating multi-line CAP LS output.
const TEMP_CAP_OFFERED: &str = "cap.offered";

/// Errors on the upstream link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtocolError),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("invalid server name: {0}")]
    ServerName(String),
    #[error("no host configured")]
    NoHost,
}

/// Byte stream to a network: plain TCP or TLS.
trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type UpstreamTransport = Framed<Box<dyn AsyncStream>, IrcCodec>;

// ============================================================================
// Binder
// ============================================================================

/// Bind a freshly authenticated downstream to its network's upstream,
/// creating or redialing the upstream as needed.
pub async fn bind_upstream(ctx: &mut Context<'_>, net: &NetworkRecord) -> Result<(), HandlerError> {
    let con_id = ctx.con.con_id().to_string();

    // Lookup-then-create must be serialized: two clients authenticating at
    // once may not both create an upstream for the same pair.
    let _gate = ctx.bnc.upstream_gate.lock().await;

    let existing = ctx
        .bnc
        .registry
        .find_users_outgoing_connection(net.user_id, net.id)
        .await;

    match existing {
        Some(upstream) => {
            let (connected, registered) = {
                let state = upstream.state.lock().await;
                (state.connected, state.net_registered)
            };

            if connected {
                ctx.write_status("Attaching you to the network")?;
                upstream.state.lock().await.link_incoming(&con_id).await?;
                if registered {
                    let snapshot = snapshot_registration(&upstream).await;
                    replay_registration(&snapshot, ctx.con, ctx.out_tx);
                    ctx.con.net_registered = true;
                    ctx.con.save().await?;
                }
            } else {
                ctx.write_status("Connecting to the network..")?;
                upstream.state.lock().await.link_incoming(&con_id).await?;
                upstream.control(UpstreamCommand::Open);
            }
        }
        None => {
            ctx.write_status("Connecting to the network..")?;
            let upstream = make_upstream(ctx.bnc, net).await?;
            upstream.state.lock().await.link_incoming(&con_id).await?;
            upstream.control(UpstreamCommand::Open);
        }
    }

    Ok(())
}

/// Create the upstream record and task for a network. The caller opens it.
pub async fn make_upstream(
    bnc: &Arc<Bouncer>,
    net: &NetworkRecord,
) -> Result<Arc<ConnectionHandle>, HandlerError> {
    let con_id = uuid::Uuid::new_v4().to_string();
    let mut state = ConnState::new(&con_id, ConKind::Outgoing, bnc.db.clone());
    state.auth_user_id = net.user_id;
    state.auth_network_id = net.id;
    state.auth_network_name = net.name.clone();
    state.server_prefix = bnc.config.server.prefix.clone();
    state.load_connection_info(&bnc.db.users()).await?;

    if state.nick.is_empty() {
        if let Some(user) = bnc.db.users().get_user(net.user_id).await? {
            state.nick = user.username;
        }
    }
    if state.username.is_empty() {
        state.username = state.nick.clone();
    }
    if state.realname.is_empty() {
        state.realname = state.nick.clone();
    }

    state.save().await?;

    info!(
        con_id = %con_id,
        network = %net.name,
        host = %state.host,
        "Upstream created"
    );

    Ok(spawn_upstream(Arc::clone(bnc), state))
}

/// Register the record, spawn its session task and return the handle.
pub fn spawn_upstream(bnc: Arc<Bouncer>, state: ConnState) -> Arc<ConnectionHandle> {
    let con_id = state.con_id().to_string();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();

    let handle = Arc::new(ConnectionHandle {
        con_id: con_id.clone(),
        kind: ConKind::Outgoing,
        state: Arc::new(tokio::sync::Mutex::new(state)),
        out_tx,
        ctl_tx: Some(ctl_tx),
    });

    bnc.registry.insert(Arc::clone(&handle));

    let task_handle = Arc::clone(&handle);
    tokio::spawn(async move {
        run_upstream(bnc, task_handle, out_rx, ctl_rx).await;
    });

    handle
}

// ============================================================================
// Session task
// ============================================================================

/// What one iteration of the session loop decided.
enum Step {
    Continue,
    Dialed(Box<UpstreamTransport>),
    Disconnect(&'static str),
    Stop,
}

async fn run_upstream(
    bnc: Arc<Bouncer>,
    handle: Arc<ConnectionHandle>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    mut ctl_rx: mpsc::UnboundedReceiver<UpstreamCommand>,
) {
    let mut shutdown_rx = bnc.shutdown_tx.subscribe();
    let mut transport: Option<UpstreamTransport> = None;

    loop {
        let step = match transport.as_mut() {
            Some(framed) => {
                connected_step(&bnc, &handle, framed, &mut out_rx, &mut ctl_rx, &mut shutdown_rx)
                    .await
            }
            None => idle_step(&bnc, &handle, &mut ctl_rx, &mut shutdown_rx).await,
        };

        match step {
            Step::Continue => {}
            Step::Dialed(framed) => transport = Some(*framed),
            Step::Disconnect(reason) => {
                transport = None;
                mark_disconnected(&bnc, &handle, reason).await;
            }
            Step::Stop => break,
        }
    }

    debug!(con_id = %handle.con_id, "Upstream task stopped");
}

async fn connected_step(
    bnc: &Arc<Bouncer>,
    handle: &Arc<ConnectionHandle>,
    framed: &mut UpstreamTransport,
    out_rx: &mut mpsc::UnboundedReceiver<Message>,
    ctl_rx: &mut mpsc::UnboundedReceiver<UpstreamCommand>,
    shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
) -> Step {
    tokio::select! {
        line = framed.next() => match line {
            Some(Ok(msg)) => {
                let actions = match handle_line(handle, &msg).await {
                    Ok(actions) => actions,
                    Err(e) => {
                        warn!(con_id = %handle.con_id, error = %e, "Upstream line handling failed");
                        return Step::Continue;
                    }
                };
                match run_actions(bnc, handle, framed, actions).await {
                    Ok(()) => Step::Continue,
                    Err(e) => {
                        warn!(con_id = %handle.con_id, error = %e, "Upstream write failed");
                        Step::Disconnect("write failed")
                    }
                }
            }
            Some(Err(ProtocolError::InvalidMessage { string, cause })) => {
                debug!(con_id = %handle.con_id, line = %string, error = %cause, "Unparseable upstream line dropped");
                Step::Continue
            }
            Some(Err(e)) => {
                warn!(con_id = %handle.con_id, error = %e, "Upstream read error");
                Step::Disconnect("read error")
            }
            None => {
                info!(con_id = %handle.con_id, "Upstream closed the connection");
                Step::Disconnect("connection closed")
            }
        },
        Some(msg) = out_rx.recv() => {
            match framed.send(msg).await {
                Ok(()) => Step::Continue,
                Err(e) => {
                    warn!(con_id = %handle.con_id, error = %e, "Upstream write failed");
                    Step::Disconnect("write failed")
                }
            }
        }
        Some(cmd) = ctl_rx.recv() => {
            match apply_command_connected(handle, framed, cmd).await {
                Ok(true) => Step::Continue,
                Ok(false) => Step::Disconnect("closed"),
                Err(e) => {
                    warn!(con_id = %handle.con_id, error = %e, "Upstream command failed");
                    Step::Disconnect("write failed")
                }
            }
        }
        _ = shutdown_rx.recv() => Step::Stop,
    }
}

async fn idle_step(
    bnc: &Arc<Bouncer>,
    handle: &Arc<ConnectionHandle>,
    ctl_rx: &mut mpsc::UnboundedReceiver<UpstreamCommand>,
    shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
) -> Step {
    tokio::select! {
        cmd = ctl_rx.recv() => match cmd {
            Some(UpstreamCommand::Open) => {
                match dial(bnc, handle).await {
                    Ok(framed) => Step::Dialed(Box::new(framed)),
                    Err(e) => {
                        warn!(con_id = %handle.con_id, error = %e, "Upstream dial failed");
                        Step::Disconnect("dial failed")
                    }
                }
            }
            Some(UpstreamCommand::DelBuffer { name }) => {
                let mut state = handle.state.lock().await;
                if let Err(e) = apply_del_buffer(&mut state, &name).await {
                    warn!(con_id = %handle.con_id, error = %e, "DelBuffer failed");
                }
                Step::Continue
            }
            // Nothing to forward or close while disconnected.
            Some(UpstreamCommand::Forward(_)) | Some(UpstreamCommand::Close) => Step::Continue,
            None => Step::Stop,
        },
        _ = shutdown_rx.recv() => Step::Stop,
    }
}

/// Handle one control command while connected. Returns false when the link
/// should drop.
async fn apply_command_connected(
    handle: &Arc<ConnectionHandle>,
    framed: &mut UpstreamTransport,
    cmd: UpstreamCommand,
) -> Result<bool, LinkError> {
    match cmd {
        UpstreamCommand::Forward(msg) => {
            framed.send(msg).await?;
            Ok(true)
        }
        UpstreamCommand::Open => Ok(true),
        UpstreamCommand::Close => Ok(false),
        UpstreamCommand::DelBuffer { name } => {
            let part = {
                let mut state = handle.state.lock().await;
                apply_del_buffer(&mut state, &name).await?
            };
            if let Some(part) = part {
                framed.send(part).await?;
            }
            Ok(true)
        }
    }
}

/// Remove a buffer; returns the PART to send when it was a joined channel.
/// A missing buffer is a clean no-op.
async fn apply_del_buffer(
    state: &mut ConnState,
    name: &str,
) -> Result<Option<Message>, DbError> {
    let Some(buffer) = state.get_buffer(name) else {
        return Ok(None);
    };

    let part = (buffer.is_channel && buffer.joined)
        .then(|| Message::new("PART", [buffer.name.clone()]));
    state.del_buffer(name);
    state.save().await?;
    Ok(part)
}

// ============================================================================
// Dialing
// ============================================================================

async fn dial(
    bnc: &Arc<Bouncer>,
    handle: &Arc<ConnectionHandle>,
) -> Result<UpstreamTransport, LinkError> {
    let (host, port, tls, tlsverify, bind_host, nick, username, realname, password) = {
        let mut state = handle.state.lock().await;
        // Pick up edits to the network definition made since last dial.
        state.load_connection_info(&bnc.db.users()).await?;
        (
            state.host.clone(),
            state.port,
            state.tls,
            state.tlsverify,
            state.bind_host.clone(),
            state.nick.clone(),
            state.username.clone(),
            state.realname.clone(),
            state.password.clone(),
        )
    };

    if host.is_empty() {
        return Err(LinkError::NoHost);
    }

    info!(con_id = %handle.con_id, host = %host, port = %port, tls = %tls, "Dialing upstream");

    let addr = lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| LinkError::ServerName(host.clone()))?;

    let tcp = if bind_host.is_empty() {
        TcpStream::connect(addr).await?
    } else {
        let bind_addr: std::net::IpAddr = bind_host
            .parse()
            .map_err(|_| LinkError::ServerName(bind_host.clone()))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(std::net::SocketAddr::new(bind_addr, 0))?;
        socket.connect(addr).await?
    };

    let stream: Box<dyn AsyncStream> = if tls {
        let config = tls_client_config(tlsverify);
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| LinkError::ServerName(host.clone()))?;
        Box::new(connector.connect(server_name, tcp).await?)
    } else {
        Box::new(tcp)
    };

    let mut framed = Framed::new(stream, IrcCodec::new());

    // A fresh session invalidates the captured burst from the previous one.
    let linked = {
        let mut state = handle.state.lock().await;
        state.connected = true;
        state.net_registered = false;
        state.received_motd = false;
        state.registration_lines.clear();
        state.isupports.clear();
        state.temp_set(TEMP_CAP_OFFERED, None).await?;

        if !password.is_empty() {
            framed.send(Message::new("PASS", [password.as_str()])).await?;
        }
        framed.send(Message::new("CAP", ["LS", "302"])).await?;
        framed.send(Message::new("NICK", [nick.as_str()])).await?;
        framed
            .send(Message::new("USER", [username.as_str(), "0", "*", realname.as_str()]))
            .await?;

        state.linked_incoming.clone()
    };

    status_to_clients(bnc, &linked, &format!("Connected to {}, registering..", host)).await;

    Ok(framed)
}

/// Client TLS config: native roots, or accept-anything when verification is
/// disabled for the network.
fn tls_client_config(verify: bool) -> ClientConfig {
    if verify {
        let mut roots = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            if let Err(e) = roots.add(cert) {
                warn!(error = %e, "Failed to add root cert");
            }
        }
        for e in &certs.errors {
            warn!(error = %e, "Error loading native certs");
        }

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    }
}

/// Accepts all certificates. Used only when the network sets tlsverify=false
/// (self-signed upstream certs).
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &tokio_rustls::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA512,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

// ============================================================================
// Inbound line handling
// ============================================================================

/// Follow-up work produced by a state transition.
#[derive(Debug)]
pub(crate) enum UpstreamAction {
    /// Write a line to the network socket.
    SendUpstream(Message),
    /// Deliver a line to every linked client.
    Relay(Message),
    /// The upstream completed registration: synthesize bursts for clients.
    RegisterClients,
    /// Persist a message to the store.
    Log {
        buffer: String,
        sender: String,
        command: String,
        text: String,
    },
    /// Status notice to every linked client.
    Status(String),
}

async fn handle_line(
    handle: &Arc<ConnectionHandle>,
    msg: &Message,
) -> Result<Vec<UpstreamAction>, DbError> {
    let mut state = handle.state.lock().await;
    apply_line(&mut state, msg).await
}

async fn run_actions(
    bnc: &Arc<Bouncer>,
    handle: &Arc<ConnectionHandle>,
    framed: &mut UpstreamTransport,
    actions: Vec<UpstreamAction>,
) -> Result<(), LinkError> {
    for action in actions {
        match action {
            UpstreamAction::SendUpstream(msg) => framed.send(msg).await?,
            UpstreamAction::Relay(msg) => {
                let linked = { handle.state.lock().await.linked_incoming.clone() };
                bnc.registry.send_to_linked(&linked, None, &msg);
            }
            UpstreamAction::RegisterClients => {
                register_linked_clients(bnc, handle).await;
            }
            UpstreamAction::Log {
                buffer,
                sender,
                command,
                text,
            } => {
                let (user_id, network_id) = {
                    let state = handle.state.lock().await;
                    (state.auth_user_id, state.auth_network_id)
                };
                bnc.db
                    .messages()
                    .store(user_id, network_id, &buffer, &sender, &command, &text)
                    .await?;
            }
            UpstreamAction::Status(text) => {
                let linked = { handle.state.lock().await.linked_incoming.clone() };
                status_to_clients(bnc, &linked, &text).await;
            }
        }
    }
    Ok(())
}

/// Apply one upstream line to the record, returning follow-up actions.
///
/// The record's own lock serializes all writes; this function never touches
/// another connection.
pub(crate) async fn apply_line(
    state: &mut ConnState,
    msg: &Message,
) -> Result<Vec<UpstreamAction>, DbError> {
    let mut actions = Vec::new();
    let cmd = msg.command.as_str();
    let from_self = msg
        .source_nickname()
        .is_some_and(|nick| slbnc_proto::irc_eq(nick, &state.nick));

    match cmd {
        "PING" => {
            let token = msg.param(0).unwrap_or("");
            actions.push(UpstreamAction::SendUpstream(Message::new("PONG", [token])));
            return Ok(actions);
        }

        "CAP" => {
            actions.extend(apply_server_cap(state, msg).await?);
            return Ok(actions);
        }

        "AUTHENTICATE" => {
            if msg.param(0) == Some("+") {
                let creds = format!("\0{}\0{}", state.sasl.account, state.sasl.password);
                let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
                actions.push(UpstreamAction::SendUpstream(Message::new(
                    "AUTHENTICATE",
                    [encoded],
                )));
            }
            return Ok(actions);
        }

        // SASL outcome numerics: negotiation is over either way.
        "903" => {
            actions.push(UpstreamAction::SendUpstream(Message::new("CAP", ["END"])));
            return Ok(actions);
        }
        "904" | "905" | "906" | "907" => {
            actions.push(UpstreamAction::Status("SASL authentication failed".to_string()));
            actions.push(UpstreamAction::SendUpstream(Message::new("CAP", ["END"])));
            return Ok(actions);
        }

        "001" => {
            if let Some(nick) = msg.param(0) {
                state.nick = nick.to_string();
            }
        }

        "005" => {
            // Middle params are the ISUPPORT tokens; first is our nick and
            // the trailing is boilerplate.
            let count = msg.params.len();
            if count > 2 {
                for token in &msg.params[1..count - 1] {
                    state.isupports.push(token.clone());
                }
            }
        }

        "376" | "422" => {
            if !state.received_motd {
                capture_registration_line(state, msg);
                state.received_motd = true;
                state.net_registered = true;
                state.save().await?;
                info!(host = %state.host, nick = %state.nick, "Upstream registered");
                actions.push(UpstreamAction::RegisterClients);
                return Ok(actions);
            }
        }

        "NICK" if from_self => {
            if let Some(new_nick) = msg.param(0) {
                state.nick = new_nick.to_string();
                state.save().await?;
            }
        }

        "JOIN" if from_self => {
            if let Some(channel) = msg.param(0) {
                let channel = channel.to_string();
                let buffer = state.get_or_add_buffer(&channel);
                buffer.joined = true;
                state.save().await?;
            }
        }

        "PART" if from_self => {
            if let Some(channel) = msg.param(0)
                && let Some(buffer) = state.get_buffer_mut(channel)
            {
                buffer.joined = false;
                state.save().await?;
            }
        }

        "KICK" => {
            let kicked_us = msg
                .param(1)
                .is_some_and(|nick| slbnc_proto::irc_eq(nick, &state.nick));
            if kicked_us
                && let Some(channel) = msg.param(0)
                && let Some(buffer) = state.get_buffer_mut(channel)
            {
                buffer.joined = false;
                state.save().await?;
            }
        }

        "332" => {
            if let (Some(channel), Some(topic)) = (msg.param(1), msg.param(2)) {
                let channel = channel.to_string();
                let topic = topic.to_string();
                state.get_or_add_buffer(&channel).topic = topic;
                state.save().await?;
            }
        }

        "TOPIC" => {
            if let (Some(channel), Some(topic)) = (msg.param(0), msg.param(1)) {
                let channel = channel.to_string();
                let topic = topic.to_string();
                state.get_or_add_buffer(&channel).topic = topic;
                state.save().await?;
            }
        }

        "PRIVMSG" | "NOTICE" => {
            if let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) {
                let sender = msg.source_nickname().unwrap_or("").to_string();
                let buffer_name = if state.is_channel_name(target) {
                    target.to_string()
                } else {
                    sender.clone()
                };
                if !buffer_name.is_empty() {
                    let now = chrono::Utc::now().timestamp();
                    state.get_or_add_buffer(&buffer_name).last_seen = now;
                    state.save().await?;

                    if state.logging {
                        actions.push(UpstreamAction::Log {
                            buffer: buffer_name,
                            sender,
                            command: cmd.to_string(),
                            text: text.to_string(),
                        });
                    }
                }
            }
        }

        _ => {}
    }

    if !state.received_motd {
        // Everything up to end-of-MOTD belongs to the replayable burst.
        capture_registration_line(state, msg);
        state.save().await?;
    } else {
        actions.push(UpstreamAction::Relay(msg.clone()));
    }

    Ok(actions)
}

fn capture_registration_line(state: &mut ConnState, msg: &Message) {
    state.registration_lines.push(msg.to_string());
}

/// Server-side CAP negotiation: request what we want of what is offered,
/// run SASL when configured, then close with CAP END.
async fn apply_server_cap(
    state: &mut ConnState,
    msg: &Message,
) -> Result<Vec<UpstreamAction>, DbError> {
    let mut actions = Vec::new();
    // Server form: CAP <nick|*> <sub> [*] :<caps>
    let sub = msg.param(1).unwrap_or("").to_uppercase();

    match sub.as_str() {
        "LS" => {
            let more = msg.param(2) == Some("*");
            let caps_arg = msg.params.last().cloned().unwrap_or_default();

            let mut offered: Vec<String> = state
                .temp_get(TEMP_CAP_OFFERED)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            offered.extend(caps_arg.split_whitespace().map(str::to_string));

            if more {
                state
                    .temp_set(TEMP_CAP_OFFERED, Some(serde_json::to_value(offered)?))
                    .await?;
                return Ok(actions);
            }
            state.temp_set(TEMP_CAP_OFFERED, None).await?;

            let want_sasl = !state.sasl.account.is_empty();
            let mut request: Vec<&str> = Vec::new();
            for cap in WANTED_CAPS {
                if offered.iter().any(|o| o.split('=').next() == Some(*cap)) {
                    request.push(cap);
                }
            }
            if want_sasl && offered.iter().any(|o| o.split('=').next() == Some("sasl")) {
                request.push("sasl");
            }

            if request.is_empty() {
                actions.push(UpstreamAction::SendUpstream(Message::new("CAP", ["END"])));
            } else {
                let request = request.join(" ");
                actions.push(UpstreamAction::SendUpstream(Message::new(
                    "CAP",
                    ["REQ", request.as_str()],
                )));
            }
        }
        "ACK" => {
            let acked = msg.params.last().cloned().unwrap_or_default();
            for cap in acked.split_whitespace() {
                state.caps.insert(cap.to_string());
            }
            state.save().await?;

            if acked.split_whitespace().any(|c| c == "sasl") {
                actions.push(UpstreamAction::SendUpstream(Message::new(
                    "AUTHENTICATE",
                    ["PLAIN"],
                )));
            } else {
                actions.push(UpstreamAction::SendUpstream(Message::new("CAP", ["END"])));
            }
        }
        "NAK" => {
            actions.push(UpstreamAction::SendUpstream(Message::new("CAP", ["END"])));
        }
        _ => {}
    }

    Ok(actions)
}

// ============================================================================
// Disconnect and status plumbing
// ============================================================================

async fn mark_disconnected(bnc: &Arc<Bouncer>, handle: &Arc<ConnectionHandle>, reason: &str) {
    let linked = {
        let mut state = handle.state.lock().await;
        state.connected = false;
        state.net_registered = false;
        state.received_motd = false;
        if let Err(e) = state.save().await {
            warn!(con_id = %handle.con_id, error = %e, "Failed to persist disconnect");
        }
        state.linked_incoming.clone()
    };

    status_to_clients(bnc, &linked, &format!("Disconnected from the network ({})", reason)).await;
}

/// Deliver a status line to a set of clients, addressed to each one's nick.
async fn status_to_clients(
    bnc: &Arc<Bouncer>,
    linked: &std::collections::HashSet<String>,
    text: &str,
) {
    for con_id in linked {
        if let Some(down) = bnc.registry.get(con_id) {
            let (nick, prefix) = {
                let state = down.state.lock().await;
                (state.nick.clone(), state.server_prefix.clone())
            };
            let target = if nick.is_empty() { "*" } else { nick.as_str() };
            let msg = Message::new("PRIVMSG", [target, text])
                .with_prefix(Prefix::ServerName(prefix));
            down.send(msg);
        }
    }
}

// ============================================================================
// Attach synthesis
// ============================================================================

/// Everything a client needs for a synthetic registration, captured in one
/// lock scope so the replay itself runs without holding the upstream record.
pub struct RegistrationSnapshot {
    pub nick: String,
    pub registration_lines: Vec<String>,
    pub buffers: Vec<Buffer>,
    pub server_prefix: String,
}

pub async fn snapshot_registration(handle: &Arc<ConnectionHandle>) -> RegistrationSnapshot {
    let state = handle.state.lock().await;
    RegistrationSnapshot {
        nick: state.nick.clone(),
        registration_lines: state.registration_lines.clone(),
        buffers: state.buffers().cloned().collect(),
        server_prefix: state.server_prefix.clone(),
    }
}

/// Replay the captured burst and current channel state into one client.
pub fn replay_registration(
    snapshot: &RegistrationSnapshot,
    con: &mut ConnState,
    out_tx: &mpsc::UnboundedSender<Message>,
) {
    for line in &snapshot.registration_lines {
        match line.parse::<Message>() {
            Ok(msg) => {
                let _ = out_tx.send(msg);
            }
            Err(e) => {
                debug!(error = %e, "Skipping unparseable stored registration line");
            }
        }
    }

    // Align the client onto the nick the network actually knows us by.
    if !snapshot.nick.is_empty() && con.nick != snapshot.nick {
        let old = if con.nick.is_empty() { "*" } else { &con.nick };
        let _ = out_tx.send(
            Message::new("NICK", [snapshot.nick.as_str()])
                .with_prefix(Prefix::Nickname(old.to_string(), String::new(), String::new())),
        );
        con.nick = snapshot.nick.clone();
    }

    for buffer in &snapshot.buffers {
        if !buffer.joined {
            continue;
        }
        let _ = out_tx.send(Message::new("JOIN", [buffer.name.as_str()]).with_prefix(
            Prefix::Nickname(snapshot.nick.clone(), "bnc".to_string(), "bnc".to_string()),
        ));
        if !buffer.topic.is_empty() {
            let _ = out_tx.send(
                Message::new(
                    "332",
                    [snapshot.nick.as_str(), buffer.name.as_str(), buffer.topic.as_str()],
                )
                .with_prefix(Prefix::ServerName(snapshot.server_prefix.clone())),
            );
        }
    }
}

/// Hand the synthetic registration to every linked client that is still
/// waiting for it.
async fn register_linked_clients(bnc: &Arc<Bouncer>, handle: &Arc<ConnectionHandle>) {
    let snapshot = snapshot_registration(handle).await;
    let linked = { handle.state.lock().await.linked_incoming.clone() };

    for con_id in linked {
        let Some(down) = bnc.registry.get(&con_id) else {
            continue;
        };

        let mut state = down.state.lock().await;
        if state.net_registered {
            continue;
        }
        replay_registration(&snapshot, &mut state, &down.out_tx);
        state.net_registered = true;
        if let Err(e) = state.save().await {
            warn!(con_id = %con_id, error = %e, "Failed to persist client registration");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
