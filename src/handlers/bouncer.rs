//! The BOUNCER administrative verb.
//!
//! Sub-commands operate on the networks owned by the authenticated user:
//! CONNECT, DISCONNECT, LISTNETWORKS, LISTBUFFERS, DELBUFFER. Argument
//! failures answer with the literal `ERR_INVALIDARGS` / `ERR_NETNOTFOUND`
//! tokens; the connection stays open either way.

use std::sync::Arc;

use async_trait::async_trait;
use slbnc_proto::{Message, tags};

use super::{Context, Disposition, Handler};
use crate::db::NetworkRecord;
use crate::error::{HandlerError, HandlerResult};
use crate::network::upstream;
use crate::state::{ConnectionHandle, UpstreamCommand};

pub struct BouncerHandler;

#[async_trait]
impl Handler for BouncerHandler {
    async fn handle(&self, ctx: &mut Context<'_>, msg: &Message) -> HandlerResult {
        let subcmd = msg.param(0).unwrap_or("").to_uppercase();

        match subcmd.as_str() {
            "CONNECT" => connect(ctx, msg.param(1)).await,
            "DISCONNECT" => disconnect(ctx, msg.param(1)).await,
            "LISTNETWORKS" => list_networks(ctx).await,
            "LISTBUFFERS" => list_buffers(ctx, msg.param(1)).await,
            "DELBUFFER" => del_buffer(ctx, msg.param(1), msg.param(2)).await,
            _ => Ok(Disposition::Handled),
        }
    }

    fn available_caps(&self) -> &'static [&'static str] {
        &["bouncer"]
    }
}

fn reply<'a>(
    ctx: &Context<'_>,
    params: impl IntoIterator<Item = &'a str>,
) -> Result<(), HandlerError> {
    ctx.send_from_bnc(Message::new("BOUNCER", params))
}

/// Resolve a network argument against the authenticated user's networks.
async fn lookup_network(
    ctx: &Context<'_>,
    subcmd: &str,
    name: Option<&str>,
) -> Result<Option<NetworkRecord>, HandlerError> {
    let Some(name) = name else {
        reply(ctx, [subcmd, "ERR_INVALIDARGS"])?;
        return Ok(None);
    };

    let net = ctx
        .bnc
        .db
        .users()
        .get_network_by_name(ctx.con.auth_user_id, name)
        .await?;

    if net.is_none() {
        reply(ctx, [subcmd, name, "ERR_NETNOTFOUND"])?;
    }
    Ok(net)
}

async fn find_upstream(
    ctx: &Context<'_>,
    net: &NetworkRecord,
) -> Option<Arc<ConnectionHandle>> {
    ctx.bnc
        .registry
        .find_users_outgoing_connection(net.user_id, net.id)
        .await
}

/// Dial the network's upstream, creating it first if none exists.
pub(super) async fn open_or_create_upstream(
    ctx: &Context<'_>,
    net: &NetworkRecord,
) -> Result<(), HandlerError> {
    let _gate = ctx.bnc.upstream_gate.lock().await;
    let upstream = match find_upstream(ctx, net).await {
        Some(handle) => handle,
        None => upstream::make_upstream(ctx.bnc, net).await?,
    };

    let connected = { upstream.state.lock().await.connected };
    if !connected {
        upstream.control(UpstreamCommand::Open);
    }
    Ok(())
}

async fn connect(ctx: &mut Context<'_>, name: Option<&str>) -> HandlerResult {
    let Some(net) = lookup_network(ctx, "connect", name).await? else {
        return Ok(Disposition::Handled);
    };
    // No reply on success.
    open_or_create_upstream(ctx, &net).await?;
    Ok(Disposition::Handled)
}

async fn disconnect(ctx: &mut Context<'_>, name: Option<&str>) -> HandlerResult {
    let Some(net) = lookup_network(ctx, "disconnect", name).await? else {
        return Ok(Disposition::Handled);
    };

    if let Some(upstream) = find_upstream(ctx, &net).await {
        let connected = { upstream.state.lock().await.connected };
        if connected {
            upstream.control(UpstreamCommand::Close);
        }
    }
    Ok(Disposition::Handled)
}

/// Connection-state label for a network.
pub(super) async fn network_state_label(ctx: &Context<'_>, net: &NetworkRecord) -> &'static str {
    match find_upstream(ctx, net).await {
        None => "disconnected",
        Some(upstream) => {
            if upstream.state.lock().await.connected {
                "connected"
            } else {
                "disconnect"
            }
        }
    }
}

async fn list_networks(ctx: &mut Context<'_>) -> HandlerResult {
    let nets = ctx
        .bnc
        .db
        .users()
        .get_user_networks(ctx.con.auth_user_id)
        .await?;

    for net in &nets {
        let state = network_state_label(ctx, net).await;
        let port = net.port.to_string();
        let encoded = tags::encode_pairs([
            ("network", net.name.as_str()),
            ("host", net.host.as_str()),
            ("port", port.as_str()),
            ("tls", if net.tls { "1" } else { "0" }),
            ("state", state),
        ]);
        reply(ctx, ["listnetworks", encoded.as_str()])?;
    }

    // Historical wire detail: the terminator drops the plural.
    reply(ctx, ["listnetwork", "RPL_OK"])?;
    Ok(Disposition::Handled)
}

async fn list_buffers(ctx: &mut Context<'_>, name: Option<&str>) -> HandlerResult {
    let Some(net) = lookup_network(ctx, "listbuffers", name).await? else {
        return Ok(Disposition::Handled);
    };

    if let Some(upstream) = find_upstream(ctx, &net).await {
        let state = upstream.state.lock().await;
        for buffer in state.buffers() {
            let encoded = tags::encode_pairs([
                ("network", net.name.as_str()),
                ("buffer", buffer.name.as_str()),
                ("joined", if buffer.joined { "1" } else { "0" }),
                ("topic", buffer.topic.as_str()),
            ]);
            reply(ctx, ["listbuffers", net.name.as_str(), encoded.as_str()])?;
        }
    }

    reply(ctx, ["listbuffers", net.name.as_str(), "RPL_OK"])?;
    Ok(Disposition::Handled)
}

async fn del_buffer(
    ctx: &mut Context<'_>,
    name: Option<&str>,
    buffer: Option<&str>,
) -> HandlerResult {
    let Some(buffer) = buffer else {
        reply(ctx, ["delbuffer", "ERR_INVALIDARGS"])?;
        return Ok(Disposition::Handled);
    };
    let Some(net) = lookup_network(ctx, "delbuffer", name).await? else {
        return Ok(Disposition::Handled);
    };

    if let Some(upstream) = find_upstream(ctx, &net).await {
        upstream.control(UpstreamCommand::DelBuffer {
            name: buffer.to_string(),
        });
    }

    reply(ctx, ["delbuffer", net.name.as_str(), buffer, "RPL_OK"])?;
    Ok(Disposition::Handled)
}
