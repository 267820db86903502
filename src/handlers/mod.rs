//! Client verb handlers and the downstream dispatch state machine.
//!
//! Dispatch applies the protocol ordering rules before any handler runs:
//!
//! 1. A few verbs execute unconditionally.
//! 2. While CAP negotiation is open, every other line is held in the
//!    pre-registration queue and replayed on `CAP END` (replayed lines skip
//!    this gate).
//! 3. Before registration completes, only the handshake verbs execute; all
//!    others are silently dropped.
//! 4. Once registered, verbs dispatch through the handler table; unknown
//!    verbs forward to the upstream verbatim.

mod bouncer;
mod cap;
mod connection;
mod control;
mod messaging;
mod registration;

pub use registration::register_local_client;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use slbnc_proto::{Message, Prefix};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{HandlerError, HandlerResult};
use crate::state::{Bouncer, ConnState, RegState, UpstreamCommand};

/// Verbs that execute regardless of negotiation or registration state.
const UNCONDITIONAL_VERBS: &[&str] = &["DEB", "RELOAD", "PING"];

/// Verbs permitted before registration completes.
const PREREG_VERBS: &[&str] = &["USER", "NICK", "PASS", "CAP"];

/// What the dispatcher should do with the line after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send the line to the bound upstream verbatim.
    Forward,
    /// The line terminated locally.
    Handled,
}

/// Where a dispatched line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOrigin {
    /// Read straight off the client socket.
    Socket,
    /// Replayed from the pre-registration queue; bypasses the CAP gate.
    Queue,
}

/// Handler context passed to each verb handler.
pub struct Context<'a> {
    /// Shared process state.
    pub bnc: &'a Arc<Bouncer>,
    /// This connection's durable record, locked for the whole dispatch.
    pub con: &'a mut ConnState,
    /// Outbound queue for this connection's socket.
    pub out_tx: &'a mpsc::UnboundedSender<Message>,
    /// Where the current line came from.
    pub origin: MsgOrigin,
}

impl Context<'_> {
    /// Queue a line for the client.
    pub fn send(&self, msg: Message) -> Result<(), HandlerError> {
        self.out_tx.send(msg).map_err(|_| HandlerError::Gone)
    }

    /// Queue a line carrying the bouncer's own prefix.
    pub fn send_from_bnc(&self, msg: Message) -> Result<(), HandlerError> {
        let prefix = Prefix::ServerName(self.con.server_prefix.clone());
        self.send(msg.with_prefix(prefix))
    }

    /// Deliver a status message as a PRIVMSG from the bouncer.
    pub fn write_status(&self, text: &str) -> Result<(), HandlerError> {
        let target = if self.con.nick.is_empty() {
            "*"
        } else {
            self.con.nick.as_str()
        };
        self.send_from_bnc(Message::new("PRIVMSG", [target, text]))
    }
}

/// Trait implemented by all verb handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle an incoming message.
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult;

    /// Capability names this handler makes available to clients.
    fn available_caps(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Registry of verb handlers.
///
/// Rebuilt wholesale by RELOAD: handlers attach here at construction and the
/// table is swapped atomically, which is also where the available-caps list
/// is collected.
pub struct Registry {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
    available_caps: Vec<String>,
}

impl Registry {
    /// Create a new registry with all handlers registered.
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Box<dyn Handler>> = HashMap::new();

        handlers.insert("CAP", Box::new(cap::CapHandler));
        handlers.insert("PASS", Box::new(connection::PassHandler));
        handlers.insert("USER", Box::new(connection::UserHandler));
        handlers.insert("NICK", Box::new(connection::NickHandler));
        handlers.insert("PING", Box::new(connection::PingHandler));
        handlers.insert("QUIT", Box::new(connection::QuitHandler));
        handlers.insert("KILL", Box::new(connection::KillHandler));
        handlers.insert("RELOAD", Box::new(connection::ReloadHandler));
        handlers.insert("DEB", Box::new(connection::DebHandler));
        handlers.insert("PRIVMSG", Box::new(messaging::PrivmsgHandler));
        handlers.insert("NOTICE", Box::new(messaging::NoticeHandler));
        handlers.insert("BOUNCER", Box::new(bouncer::BouncerHandler));

        let mut available_caps = Vec::new();
        for handler in handlers.values() {
            for cap in handler.available_caps() {
                available_caps.push((*cap).to_string());
            }
        }
        available_caps.sort();

        Self {
            handlers,
            available_caps,
        }
    }

    /// Look up a handler by verb name.
    pub fn get(&self, verb: &str) -> Option<&dyn Handler> {
        self.handlers.get(verb).map(|handler| handler.as_ref())
    }

    /// Capability names offered to downstream clients.
    pub fn available_caps(&self) -> &[String] {
        &self.available_caps
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch one line and act on the forward decision.
pub async fn process_line(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let disposition = run(ctx, msg).await?;
    if disposition == Disposition::Forward {
        forward_upstream(ctx, msg).await;
    }
    Ok(())
}

/// The dispatch state machine. Returns whether the line should be forwarded
/// to the upstream.
pub async fn run(ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
    let registry = ctx.bnc.handlers();
    let verb = msg.command.clone();

    if UNCONDITIONAL_VERBS.contains(&verb.as_str()) {
        return match registry.get(&verb) {
            Some(handler) => handler.handle(ctx, msg).await,
            None => Ok(Disposition::Handled),
        };
    }

    // CAP gate: between CAP LS and CAP END nothing else may run. Lines are
    // held in arrival order; the replay on CAP END tags them as queue-origin
    // so they pass through here exactly once.
    if ctx.con.capping().is_some() && verb != "CAP" && ctx.origin != MsgOrigin::Queue {
        debug!(con_id = %ctx.con.con_id(), verb = %verb, "Holding line during CAP negotiation");
        ctx.con.push_reg_queue(msg.to_string()).await?;
        return Ok(Disposition::Handled);
    }

    if !ctx.con.net_registered {
        if !PREREG_VERBS.contains(&verb.as_str()) {
            debug!(con_id = %ctx.con.con_id(), verb = %verb, "Dropping verb before registration");
            return Ok(Disposition::Handled);
        }

        if ctx.con.reg_state().is_none() {
            ctx.con.set_reg_state(Some(RegState::default())).await?;
        }

        let result = match registry.get(&verb) {
            Some(handler) => handler.handle(ctx, msg).await?,
            None => Disposition::Handled,
        };

        registration::maybe_process_registration(ctx).await?;
        return Ok(result);
    }

    match registry.get(&verb) {
        Some(handler) => handler.handle(ctx, msg).await,
        None => Ok(Disposition::Forward),
    }
}

/// Hand a line to the connection's bound upstream, if any.
async fn forward_upstream(ctx: &Context<'_>, msg: &Message) {
    if ctx.con.auth_user_id == 0 || ctx.con.auth_network_id == 0 {
        return;
    }

    let upstream = ctx
        .bnc
        .registry
        .find_users_outgoing_connection(ctx.con.auth_user_id, ctx.con.auth_network_id)
        .await;

    if let Some(upstream) = upstream {
        upstream.control(UpstreamCommand::Forward(msg.clone()));
    }
}
