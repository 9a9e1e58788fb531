//! Per-connection actor (C6, spec §4.6): one reader + one writer task per
//! connection, driven by an explicit state struct passed between them —
//! the redesign's replacement for "per-connection closures capturing
//! mutable hook state" (spec §9).
//!
//! Grounded on the donor's `WsServer` run loop
//! (`ethers-providers/src/rpc/transports/ws/mod.rs`): a single task
//! `select!`-ing between the socket and internal channels, with a
//! dedicated channel-draining task underneath it for outbound writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chat_core::error::ChatError;
use chat_core::ids::{ChannelId, SeqId, UserId};
use chat_providers::presence::ConnId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::app::GatewayState;
use crate::ingest::{CreateMessageRequest, CreateStatus};
use crate::resync;

use super::forwarder::{self, ForwarderHandle, OverflowSignal};
use super::protocol::{AckKind, ClientFrame, ServerFrame};

/// connecting -> authenticating -> active <-> degraded -> closing ->
/// closed (spec §4.6). `Connecting`/`Closed` are not represented as
/// explicit states here because they correspond exactly to "before this
/// function runs" and "after it returns" — there is no observable
/// transition to act on between them and their neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Authenticating,
    Active,
    Degraded,
    Closing,
}

/// Drives one WebSocket connection end to end: authenticates, binds
/// presence, streams catch-up then live frames, and tears everything
/// down on close.
pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let conn_id: ConnId = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(state.config.max_outbound_buffer);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let Some((user_id, last_seen_seq_by_channel)) =
        authenticate(&mut ws_rx, &state, &out_tx).await
    else {
        drop(out_tx);
        let _ = writer.await;
        return;
    };

    tracing::info!(%user_id, %conn_id, "connection authenticated");
    state.presence.bind(user_id, state.gateway_id.clone(), conn_id);

    let kicks = if state.config.single_session {
        let rx = state.presence.subscribe_kicks(user_id);
        state.presence.announce_new_connection(user_id, conn_id);
        Some(rx)
    } else {
        None
    };

    let _ = out_tx
        .send(ServerFrame::Welcome {
            user_id,
            server_time: chrono::Utc::now().timestamp_millis(),
            session_id: conn_id,
        })
        .await;

    let overflow = OverflowSignal::default();
    let mut forwarders: HashMap<ChannelId, ForwarderHandle> = HashMap::new();

    for (channel_id, after_seq) in last_seen_seq_by_channel {
        let handle = forwarder::spawn(state.bus.as_ref(), channel_id, out_tx.clone(), overflow.clone(), true);
        forwarders.insert(channel_id, handle);
        catch_up_channel(&state, &out_tx, &mut forwarders, channel_id, after_seq).await;
    }

    run_active_loop(RunCtx {
        state,
        user_id,
        conn_id,
        ws_rx,
        out_tx,
        overflow,
        forwarders,
        kicks,
    })
    .await;

    let _ = writer.await;
}

/// Waits for the `hello` frame within the auth budget, authenticates the
/// token, and returns the identity plus requested catch-up window. Emits
/// `session_expired` and returns `None` on any failure (spec §4.6
/// `authenticating` state).
async fn authenticate(
    ws_rx: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
    state: &Arc<GatewayState>,
    out_tx: &mpsc::Sender<ServerFrame>,
) -> Option<(UserId, HashMap<ChannelId, SeqId>)> {
    let auth_budget = state.config.heartbeat_interval();
    let hello = tokio::time::timeout(auth_budget, ws_rx.next()).await;

    let frame = match hello {
        Ok(Some(Ok(WsMessage::Text(text)))) => serde_json::from_str::<ClientFrame>(&text).ok(),
        _ => None,
    };

    match frame {
        Some(ClientFrame::Hello { token, last_seen_seq_by_channel, .. }) => {
            match state.auth.authenticate(&token).await {
                Ok(user_id) => Some((user_id, last_seen_seq_by_channel)),
                Err(_) => {
                    let _ = out_tx.send(ServerFrame::SessionExpired).await;
                    None
                }
            }
        }
        _ => {
            let _ = out_tx.send(ServerFrame::SessionExpired).await;
            None
        }
    }
}

/// Pages through Resync for one channel, streaming `resync_batch`
/// frames, then tells that channel's forwarder the watermark it caught
/// up to so buffered live frames flush in order (spec §4.8).
async fn catch_up_channel(
    state: &Arc<GatewayState>,
    out_tx: &mpsc::Sender<ServerFrame>,
    forwarders: &mut HashMap<ChannelId, ForwarderHandle>,
    channel_id: ChannelId,
    after_seq: SeqId,
) {
    let mut cursor = after_seq;
    loop {
        let page = match resync::resync(&state.store, channel_id, cursor, state.config.resync_page_size).await {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(%channel_id, error = %err, "resync failed");
                break;
            }
        };
        let has_more = page.has_more;
        let next_cursor = page.next_cursor;
        let _ = out_tx
            .send(ServerFrame::ResyncBatch { channel_id, messages: page.messages, has_more })
            .await;
        match next_cursor {
            Some(seq) => cursor = seq,
            None => break,
        }
        if !has_more {
            break;
        }
    }
    if let Some(handle) = forwarders.get_mut(&channel_id) {
        handle.mark_caught_up(cursor);
    }
}

struct RunCtx<S> {
    state: Arc<GatewayState>,
    user_id: UserId,
    conn_id: ConnId,
    ws_rx: S,
    out_tx: mpsc::Sender<ServerFrame>,
    overflow: OverflowSignal,
    forwarders: HashMap<ChannelId, ForwarderHandle>,
    kicks: Option<broadcast::Receiver<ConnId>>,
}

async fn run_active_loop<S>(mut ctx: RunCtx<S>)
where
    S: StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let mut conn_state = ConnState::Active;
    let mut last_ping = Instant::now();
    let mut missed: u32 = 0;
    let mut heartbeat = tokio::time::interval(ctx.state.config.heartbeat_interval());
    heartbeat.tick().await; // first tick fires immediately; consume it

    loop {
        if conn_state == ConnState::Closing {
            break;
        }

        tokio::select! {
            biased;

            _ = ctx.overflow.notified() => {
                tracing::warn!(user_id = %ctx.user_id, conn_id = %ctx.conn_id, "outbound buffer overflow; dropping connection");
                break;
            }

            kicked = recv_kick(&mut ctx.kicks) => {
                if let Some(new_conn) = kicked {
                    if new_conn != ctx.conn_id {
                        let _ = ctx.out_tx.send(ServerFrame::SessionKicked).await;
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_ping.elapsed() > ctx.state.config.heartbeat_interval() {
                    missed += 1;
                }
                if missed >= ctx.state.config.heartbeat_misses {
                    let _ = ctx.out_tx.send(ServerFrame::SessionTimeout).await;
                    break;
                } else if missed > 0 {
                    conn_state = ConnState::Degraded;
                }
            }

            frame = ctx.ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_ping = Instant::now();
                        missed = 0;
                        conn_state = ConnState::Active;
                        if let Ok(client_frame) = serde_json::from_str::<ClientFrame>(&text) {
                            handle_client_frame(&mut ctx, client_frame).await;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    cleanup(ctx).await;
}

async fn recv_kick(kicks: &mut Option<broadcast::Receiver<ConnId>>) -> Option<ConnId> {
    match kicks {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

async fn handle_client_frame<S>(ctx: &mut RunCtx<S>, frame: ClientFrame) {
    match frame {
        ClientFrame::Hello { .. } => {
            tracing::debug!(user_id = %ctx.user_id, "ignoring duplicate hello on an active connection");
        }
        ClientFrame::Publish { channel_id, client_msg_id, content, kind, parent_id, attachments, metadata } => {
            let req = CreateMessageRequest {
                channel_id,
                sender_id: ctx.user_id,
                content,
                kind,
                parent_id,
                client_msg_id,
                metadata,
                attachments,
            };
            let frame = match ctx.state.ingest.create_message(req).await {
                Ok(result) => ServerFrame::AckResult {
                    client_msg_id,
                    msg_id: result.msg_id,
                    seq_id: result.seq_id,
                    status: match result.status {
                        CreateStatus::Persisted => "persisted",
                        CreateStatus::Duplicate => "duplicate",
                    },
                },
                Err(err) => error_frame(&err),
            };
            let _ = ctx.out_tx.send(frame).await;
        }
        ClientFrame::Ack { msg_id, kind: AckKind::Read } => {
            if let Ok(Some(message)) = ctx.state.store.find_by_msg_id(msg_id).await {
                if let Err(err) = ctx.state.store.mark_read(ctx.user_id, message.channel_id, message.seq_id).await {
                    tracing::warn!(error = %err, "mark_read failed");
                } else {
                    ctx.state.bus.publish_event(
                        message.channel_id,
                        serde_json::json!({
                            "event": "read_receipt",
                            "userId": ctx.user_id,
                            "channelId": message.channel_id,
                            "seqId": message.seq_id,
                        }),
                    );
                }
            }
        }
        ClientFrame::Ack { kind: AckKind::Delivered, .. } => {
            // Delivery receipts are not durably tracked by this core
            // (spec §4.6 lists the frame; no durable-state requirement is
            // attached to it beyond read receipts' UnreadCursor update).
        }
        ClientFrame::Ping { ts } => {
            let _ = ctx
                .out_tx
                .send(ServerFrame::Pong { ts, server_time: chrono::Utc::now().timestamp_millis() })
                .await;
        }
        ClientFrame::Subscribe { channel_id } => {
            if !ctx.forwarders.contains_key(&channel_id) {
                let handle = forwarder::spawn(
                    ctx.state.bus.as_ref(),
                    channel_id,
                    ctx.out_tx.clone(),
                    ctx.overflow.clone(),
                    false,
                );
                ctx.forwarders.insert(channel_id, handle);
            }
        }
        ClientFrame::Unsubscribe { channel_id } => {
            if let Some(handle) = ctx.forwarders.remove(&channel_id) {
                handle.abort();
            }
        }
    }
}

fn error_frame(err: &ChatError) -> ServerFrame {
    if let ChatError::Duplicate { msg_id, seq_id } = err {
        return ServerFrame::AckResult { client_msg_id: None, msg_id: *msg_id, seq_id: *seq_id, status: "duplicate" };
    }
    ServerFrame::Error { code: err.code(), message: err.to_string() }
}

async fn cleanup<S>(ctx: RunCtx<S>) {
    for (_, handle) in ctx.forwarders {
        handle.abort();
    }
    ctx.state.presence.unbind(ctx.user_id, ctx.state.gateway_id.clone(), ctx.conn_id);
    drop(ctx.out_tx);
}
