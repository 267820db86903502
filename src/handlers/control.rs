//! The `*bnc` control buffer.
//!
//! PRIVMSG to `*bnc` from an authenticated client is serviced here and never
//! forwarded. Replies come back as status messages from the bouncer.

use super::bouncer::{network_state_label, open_or_create_upstream};
use super::Context;
use crate::error::HandlerError;
use crate::state::UpstreamCommand;

/// Service one control-buffer command line.
pub async fn handle_control(ctx: &mut Context<'_>, text: &str) -> Result<(), HandlerError> {
    let mut parts = text.split_whitespace();
    let command = parts.next().unwrap_or("").to_uppercase();

    match command.as_str() {
        "" | "HELP" => {
            ctx.write_status("Commands: help, listnetworks, connect <network>, disconnect <network>")?;
        }
        "LISTNETWORKS" => {
            let nets = ctx
                .bnc
                .db
                .users()
                .get_user_networks(ctx.con.auth_user_id)
                .await?;
            if nets.is_empty() {
                ctx.write_status("No networks configured")?;
            }
            for net in &nets {
                let state = network_state_label(ctx, net).await;
                let scheme = if net.tls { "ircs" } else { "irc" };
                ctx.write_status(&format!(
                    "{} {}://{}:{} ({})",
                    net.name, scheme, net.host, net.port, state
                ))?;
            }
        }
        "CONNECT" => {
            let Some(name) = parts.next() else {
                ctx.write_status("Usage: connect <network>")?;
                return Ok(());
            };
            match ctx
                .bnc
                .db
                .users()
                .get_network_by_name(ctx.con.auth_user_id, name)
                .await?
            {
                Some(net) => {
                    open_or_create_upstream(ctx, &net).await?;
                    ctx.write_status(&format!("Connecting to {}..", net.name))?;
                }
                None => ctx.write_status(&format!("No such network: {}", name))?,
            }
        }
        "DISCONNECT" => {
            let Some(name) = parts.next() else {
                ctx.write_status("Usage: disconnect <network>")?;
                return Ok(());
            };
            match ctx
                .bnc
                .db
                .users()
                .get_network_by_name(ctx.con.auth_user_id, name)
                .await?
            {
                Some(net) => {
                    let upstream = ctx
                        .bnc
                        .registry
                        .find_users_outgoing_connection(net.user_id, net.id)
                        .await;
                    if let Some(upstream) = upstream {
                        upstream.control(UpstreamCommand::Close);
                    }
                    ctx.write_status(&format!("Disconnected from {}", net.name))?;
                }
                None => ctx.write_status(&format!("No such network: {}", name))?,
            }
        }
        _ => {
            ctx.write_status("Unknown command. Try: help")?;
        }
    }

    Ok(())
}
