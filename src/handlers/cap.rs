//! CAP negotiation: LS, LIST, REQ, END.
//!
//! `CAP LS` opens the negotiation window by setting the `capping` scratch
//! key; `CAP END` replays everything that queued up in between and then
//! closes the window.

use async_trait::async_trait;
use slbnc_proto::Message;
use tracing::debug;

use super::{Context, Disposition, Handler, MsgOrigin, process_line};
use crate::error::HandlerResult;
use crate::state::TEMP_CAPPING;

pub struct CapHandler;

#[async_trait]
impl Handler for CapHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let subcmd = msg.param(0).unwrap_or("").to_uppercase();

        match subcmd.as_str() {
            "LS" => handle_ls(ctx, msg.param(1)).await,
            "LIST" => handle_list(ctx),
            "REQ" => handle_req(ctx, msg.param(1)).await,
            "END" => handle_end(ctx).await,
            _ => Ok(Disposition::Handled),
        }
    }
}

/// `CAP LS [version]` - open the negotiation window and list offered caps.
async fn handle_ls(ctx: &mut Context<'_>, version: Option<&str>) -> HandlerResult {
    let version = version.unwrap_or("301").to_string();
    ctx.con
        .temp_set(TEMP_CAPPING, Some(serde_json::json!(version)))
        .await?;

    let caps = ctx.bnc.handlers().available_caps().join(" ");
    ctx.send_from_bnc(Message::new("CAP", ["*", "LS", caps.as_str()]))?;

    debug!(con_id = %ctx.con.con_id(), version = %version, "CAP LS sent");
    Ok(Disposition::Handled)
}

/// `CAP LIST` - list caps currently enabled on this connection.
fn handle_list(ctx: &mut Context<'_>) -> HandlerResult {
    let mut enabled: Vec<&str> = ctx.con.caps.iter().map(String::as_str).collect();
    enabled.sort_unstable();
    let enabled = enabled.join(" ");
    ctx.send_from_bnc(Message::new("CAP", ["*", "LIST", enabled.as_str()]))?;
    Ok(Disposition::Handled)
}

/// `CAP REQ :<space-list>` - enable the requested caps we offer.
async fn handle_req(ctx: &mut Context<'_>, caps_arg: Option<&str>) -> HandlerResult {
    let requested = caps_arg.unwrap_or("");
    let registry = ctx.bnc.handlers();

    let matched: Vec<&str> = requested
        .split_whitespace()
        .filter(|cap| registry.available_caps().iter().any(|a| a.as_str() == *cap))
        .collect();

    for cap in &matched {
        ctx.con.caps.insert((*cap).to_string());
    }
    ctx.con.save().await?;

    let matched = matched.join(" ");
    ctx.send_from_bnc(Message::new("CAP", ["*", "ACK", matched.as_str()]))?;

    debug!(con_id = %ctx.con.con_id(), acked = %matched, "CAP REQ ACK");
    Ok(Disposition::Handled)
}

/// `CAP END` - replay held lines in arrival order, then close the window.
async fn handle_end(ctx: &mut Context<'_>) -> HandlerResult {
    // Draining is sequential; lines that appear while draining are picked up
    // by the next round until the queue stays empty.
    loop {
        let queued = ctx.con.take_reg_queue().await?;
        if queued.is_empty() {
            break;
        }

        let prev_origin = ctx.origin;
        ctx.origin = MsgOrigin::Queue;
        for line in queued {
            match line.parse::<Message>() {
                Ok(msg) => {
                    process_line(ctx, &msg).await?;
                }
                Err(e) => {
                    debug!(con_id = %ctx.con.con_id(), error = %e, "Dropping unparseable queued line");
                }
            }
        }
        ctx.origin = prev_origin;
    }

    ctx.con.temp_set(TEMP_CAPPING, None).await?;
    debug!(con_id = %ctx.con.con_id(), "CAP negotiation complete");
    Ok(Disposition::Handled)
}
