//! PRIVMSG and NOTICE: sibling echo, message store, control intercept.
//!
//! A message a client sends is forwarded upstream verbatim, echoed to every
//! other client attached to the same upstream (so all of them see the user's
//! own traffic), and persisted to the message store. Messages aimed at the
//! `*bnc` control buffer never leave the bouncer.

use async_trait::async_trait;
use slbnc_proto::{Message, Prefix};
use tracing::debug;

use super::{Context, Disposition, Handler, control};
use crate::error::HandlerResult;

/// The control buffer pseudo-target.
pub const CONTROL_TARGET: &str = "*bnc";

pub struct PrivmsgHandler;

#[async_trait]
impl Handler for PrivmsgHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        handle_client_message(ctx, msg, "PRIVMSG").await
    }
}

pub struct NoticeHandler;

#[async_trait]
impl Handler for NoticeHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        handle_client_message(ctx, msg, "NOTICE").await
    }
}

async fn handle_client_message(
    ctx: &mut Context<'_>,
    msg: &Message,
    command: &str,
) -> HandlerResult {
    let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
        return Ok(Disposition::Handled);
    };
    let target = target.to_string();
    let text = text.to_string();

    if target.eq_ignore_ascii_case(CONTROL_TARGET) && ctx.con.auth_user_id != 0 {
        control::handle_control(ctx, &text).await?;
        return Ok(Disposition::Handled);
    }

    let upstream = ctx
        .bnc
        .registry
        .find_users_outgoing_connection(ctx.con.auth_user_id, ctx.con.auth_network_id)
        .await;

    let Some(upstream) = upstream else {
        // No bound upstream (network-less session): nothing to echo or log.
        return Ok(Disposition::Forward);
    };

    // Snapshot what we need and release the upstream record before any
    // slower work.
    let (up_nick, linked, logging, user_id, network_id) = {
        let state = upstream.state.lock().await;
        (
            state.nick.clone(),
            state.linked_incoming.clone(),
            state.logging,
            state.auth_user_id,
            state.auth_network_id,
        )
    };

    // Siblings see the message as coming from the user's own nick.
    let echo = Message::new(command, [target.as_str(), text.as_str()])
        .with_prefix(Prefix::Nickname(up_nick.clone(), String::new(), String::new()));
    ctx.bnc
        .registry
        .send_to_linked(&linked, Some(ctx.con.con_id()), &echo);

    if logging {
        ctx.bnc
            .db
            .messages()
            .store(user_id, network_id, &target, &up_nick, command, &text)
            .await?;
    }

    debug!(con_id = %ctx.con.con_id(), target = %target, "Client message fanned out");
    Ok(Disposition::Forward)
}
