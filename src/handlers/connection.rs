//! Connection-level verbs: PASS, USER, NICK, PING, QUIT, KILL, RELOAD, DEB.

use async_trait::async_trait;
use slbnc_proto::{Message, Prefix};
use tracing::info;

use super::{Context, Disposition, Handler};
use crate::error::{HandlerError, HandlerResult};

/// Numeric 464: password required.
const ERR_PASSWDMISMATCH: &str = "464";

pub struct PassHandler;

#[async_trait]
impl Handler for PassHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        // Already authenticated: a stray PASS is ignored.
        if ctx.con.auth_user_id != 0 {
            return Ok(Disposition::Handled);
        }

        if let (Some(arg), Some(mut reg)) = (msg.param(0), ctx.con.reg_state()) {
            reg.pass = arg.to_string();
            ctx.con.set_reg_state(Some(reg)).await?;
        }
        Ok(Disposition::Handled)
    }
}

pub struct UserHandler;

#[async_trait]
impl Handler for UserHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        // Never forwarded: the bouncer sends its own USER upstream.
        if let (Some(arg), Some(mut reg)) = (msg.param(0), ctx.con.reg_state()) {
            reg.user = arg.to_string();
            ctx.con.set_reg_state(Some(reg)).await?;
        }
        Ok(Disposition::Handled)
    }
}

pub struct NickHandler;

#[async_trait]
impl Handler for NickHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let Some(nick) = msg.param(0) else {
            return Ok(Disposition::Handled);
        };

        if !ctx.con.net_registered {
            // Record the nick durably, acknowledge it, then point the client
            // at the password step.
            ctx.con.nick = nick.to_string();
            if let Some(mut reg) = ctx.con.reg_state() {
                reg.nick = nick.to_string();
                ctx.con.set_reg_state(Some(reg)).await?;
            } else {
                ctx.con.save().await?;
            }

            ctx.send(
                Message::new("NICK", [nick])
                    .with_prefix(Prefix::Nickname(nick.to_string(), String::new(), String::new())),
            )?;

            ctx.send_from_bnc(Message::new(
                ERR_PASSWDMISMATCH,
                [nick, "Password required"],
            ))?;
            ctx.send_from_bnc(Message::new(
                "NOTICE",
                [
                    nick,
                    "You must send your password first. Try: /quote PASS <username>/<network>:<password>",
                ],
            ))?;
            return Ok(Disposition::Handled);
        }

        // Swallow nick changes while the upstream is still registering so
        // they cannot interfere with its handshake.
        let upstream = ctx
            .bnc
            .registry
            .find_users_outgoing_connection(ctx.con.auth_user_id, ctx.con.auth_network_id)
            .await;
        if let Some(upstream) = upstream {
            let state = upstream.state.lock().await;
            if !state.net_registered {
                return Ok(Disposition::Handled);
            }
        }

        Ok(Disposition::Forward)
    }
}

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let token = msg.param(0).unwrap_or("");
        ctx.send_from_bnc(Message::new("PONG", [token]))?;
        Ok(Disposition::Handled)
    }
}

pub struct QuitHandler;

#[async_trait]
impl Handler for QuitHandler {
    async fn handle(&self, _ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        // The upstream stays alive for future attaches; only this client
        // connection ends.
        Err(HandlerError::Quit)
    }
}

pub struct KillHandler;

#[async_trait]
impl Handler for KillHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        info!(con_id = %ctx.con.con_id(), "KILL received - shutting down");
        // The connection task owns the shutdown call.
        Err(HandlerError::Shutdown)
    }
}

pub struct ReloadHandler;

#[async_trait]
impl Handler for ReloadHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        ctx.bnc.reload_handlers();
        info!(con_id = %ctx.con.con_id(), "Handler table rebuilt");
        ctx.write_status("Reloaded")?;
        Ok(Disposition::Handled)
    }
}

/// Debug dump of the connection record.
pub struct DebHandler;

#[async_trait]
impl Handler for DebHandler {
    async fn handle(&self, ctx: &mut Context<'_>, _msg: &Message) -> HandlerResult {
        let con = &ctx.con;
        let mut caps: Vec<&str> = con.caps.iter().map(String::as_str).collect();
        caps.sort_unstable();

        let lines = [
            format!("con {} ({})", con.con_id(), con.kind.as_str()),
            format!(
                "netRegistered={} connected={} authUserId={} authNetworkId={}",
                con.net_registered, con.connected, con.auth_user_id, con.auth_network_id
            ),
            format!("caps: {}", caps.join(" ")),
            format!("buffers: {}", con.buffers().count()),
        ];
        for line in lines {
            ctx.write_status(&line)?;
        }
        Ok(Disposition::Handled)
    }
}
