//! Completing client registration: the password triple and authentication.
//!
//! The bouncer login travels in PASS as `user[/network][:password]`. With a
//! network given the client is bound to that network's upstream; without one
//! the client lands in a network-less session talking only to the bouncer.

use std::sync::LazyLock;

use regex::Regex;
use slbnc_proto::Message;
use tracing::{info, warn};

use super::Context;
use crate::error::HandlerError;
use crate::network::upstream;

/// Splits `user[/network][:password]` into its three parts.
static PASS_TRIPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^/:]+)(?:/([^:]+))?(?::(.*))?$").expect("password pattern is valid")
});

/// Try to complete registration once the nick/user/pass triple is present
/// and CAP negotiation has finished.
pub async fn maybe_process_registration(ctx: &mut Context<'_>) -> Result<(), HandlerError> {
    let Some(reg) = ctx.con.reg_state() else {
        return Ok(());
    };
    if !reg.complete() || ctx.con.capping().is_some() {
        return Ok(());
    }

    let Some(parts) = PASS_TRIPLE.captures(&reg.pass) else {
        return fail_auth(ctx).await;
    };
    let username = parts.get(1).map_or("", |m| m.as_str()).to_string();
    let network = parts.get(2).map_or("", |m| m.as_str()).to_string();
    let password = parts.get(3).map_or("", |m| m.as_str()).to_string();

    let users = ctx.bnc.db.users();

    if !network.is_empty() {
        let Some(net) = users
            .auth_user_network(&username, &password, &network)
            .await?
        else {
            return fail_auth(ctx).await;
        };

        ctx.con.auth_user_id = net.user_id;
        ctx.con.auth_network_id = net.id;
        ctx.con.auth_network_name = net.name.clone();
        if let Some(user) = users.get_user(net.user_id).await? {
            ctx.con.auth_admin = user.admin;
        }
        ctx.con.save().await?;

        info!(
            con_id = %ctx.con.con_id(),
            user_id = %net.user_id,
            network = %net.name,
            "Client authenticated"
        );

        upstream::bind_upstream(ctx, &net).await?;
    } else {
        let Some(user) = users.auth_user(&username, &password).await? else {
            return fail_auth(ctx).await;
        };

        ctx.con.auth_user_id = user.id;
        ctx.con.auth_admin = user.admin;
        ctx.con.save().await?;

        info!(con_id = %ctx.con.con_id(), user_id = %user.id, "Client authenticated (no network)");

        register_local_client(ctx).await?;
        ctx.write_status("Welcome to your BNC!")?;
    }

    ctx.con.set_reg_state(None).await?;
    Ok(())
}

async fn fail_auth(ctx: &mut Context<'_>) -> Result<(), HandlerError> {
    warn!(con_id = %ctx.con.con_id(), "Authentication failed");
    ctx.send(Message::new("ERROR", ["Invalid password"]))?;
    Err(HandlerError::Quit)
}

/// Synthesize a welcome burst for a client not bound to any network.
pub async fn register_local_client(ctx: &mut Context<'_>) -> Result<(), HandlerError> {
    let nick = if ctx.con.nick.is_empty() {
        "*".to_string()
    } else {
        ctx.con.nick.clone()
    };

    let welcome = format!("Welcome to your BNC, {}", nick);
    let host_line = format!("Your host is {}, running slbnc", ctx.con.server_prefix);
    ctx.send_from_bnc(Message::new("001", [nick.as_str(), welcome.as_str()]))?;
    ctx.send_from_bnc(Message::new("002", [nick.as_str(), host_line.as_str()]))?;
    ctx.send_from_bnc(Message::new("375", [nick.as_str(), "- Message of the day -"]))?;
    ctx.send_from_bnc(Message::new("376", [nick.as_str(), "End of /MOTD"]))?;

    ctx.con.net_registered = true;
    ctx.con.save().await?;
    Ok(())
}
