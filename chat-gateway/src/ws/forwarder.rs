//! Per-connection, per-channel Bus forwarder (spec §4.8 "Catch-up on
//! connect": "any live frames for that channel are buffered and flushed
//! after catch-up to maintain order").
//!
//! The forwarder subscribes to the Bus *before* Resync runs, so no
//! published envelope can be missed between "read the catch-up window"
//! and "start forwarding live traffic". Anything that arrives while
//! catch-up is still in flight is buffered in `seqId` order and flushed
//! once the caller supplies the watermark it caught up to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chat_core::ids::{ChannelId, SeqId, UserId};
use chat_core::message::Envelope;
use chat_providers::bus::{Bus, BusEventKind, RawSubscription, Subscription};
use tokio::sync::{mpsc, oneshot, Notify};

use super::protocol::ServerFrame;

/// Shared signal a forwarder (or any other outbound producer) raises
/// when the connection's outbound buffer is full. Spec §4.6 "Broadcast
/// path": "If buffer full (slow client), drops the connection after
/// grace period; client reconnects and resyncs." The connection's main
/// loop watches this and tears the connection down rather than blocking
/// forwarders on a slow socket.
#[derive(Clone, Default)]
pub struct OverflowSignal {
    flagged: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl OverflowSignal {
    pub fn raise(&self) {
        self.flagged.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        if self.is_raised() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Pushes a frame onto a bounded outbound channel without waiting;
/// raises `overflow` and returns `false` if the channel is full or
/// closed, in which case the caller should stop producing.
fn try_push(outbound: &mpsc::Sender<ServerFrame>, overflow: &OverflowSignal, frame: ServerFrame) -> bool {
    match outbound.try_send(frame) {
        Ok(()) => true,
        Err(_) => {
            overflow.raise();
            false
        }
    }
}

pub struct ForwarderHandle {
    task: tokio::task::JoinHandle<()>,
    caught_up_tx: Option<oneshot::Sender<SeqId>>,
}

impl ForwarderHandle {
    /// Tells the forwarder "catch-up is done through `watermark`"; any
    /// envelope it buffered with `seqId <= watermark` is dropped as
    /// already delivered via Resync, and everything after is flushed in
    /// order before live forwarding begins.
    pub fn mark_caught_up(&mut self, watermark: SeqId) {
        if let Some(tx) = self.caught_up_tx.take() {
            let _ = tx.send(watermark);
        }
    }

    pub fn abort(self) {
        self.task.abort();
    }
}

/// Spawns a forwarder that subscribes to `bus` for `channel_id` and
/// pushes `ServerFrame::Message`/`MessageUpdate`/`MessageDelete` onto
/// `outbound` in `seqId` order, buffering until
/// [`ForwarderHandle::mark_caught_up`] is called. Pass
/// `needs_catch_up = false` for a plain live subscription (e.g. an
/// explicit `subscribe` frame with no catch-up requirement) to skip
/// buffering entirely.
///
/// Also relays the channel's raw event stream (SPEC_FULL §11 read-receipt
/// fan-out) as `ServerFrame::ReadReceipt`. Spec §5: "Acks (delivered/read)
/// and message frames are not ordered against each other" — so events
/// forward live and are never held back by catch-up buffering.
pub fn spawn(
    bus: &dyn Bus,
    channel_id: ChannelId,
    outbound: mpsc::Sender<ServerFrame>,
    overflow: OverflowSignal,
    needs_catch_up: bool,
) -> ForwarderHandle {
    let sub = bus.subscribe(channel_id);
    let events = bus.subscribe_events(channel_id);
    let (caught_up_tx, caught_up_rx) = oneshot::channel();

    let task = tokio::spawn(run(
        sub,
        events,
        outbound,
        overflow,
        if needs_catch_up { Some(caught_up_rx) } else { None },
    ));

    ForwarderHandle { task, caught_up_tx: if needs_catch_up { Some(caught_up_tx) } else { None } }
}

/// Translates a bus message into the server frame it should appear as,
/// per spec §4.6's `message`/`message_update`/`message_delete` split.
/// `MessageDelete` carries only the identity fields, not a full envelope
/// (the envelope's content is already blanked by [`Message::to_envelope`]
/// for a soft-deleted row, but the wire frame shouldn't imply there's
/// content to read at all).
fn frame_for(kind: BusEventKind, envelope: Envelope) -> ServerFrame {
    match kind {
        BusEventKind::Created => ServerFrame::Message { envelope },
        BusEventKind::Updated => ServerFrame::MessageUpdate { envelope },
        BusEventKind::Deleted => {
            ServerFrame::MessageDelete { msg_id: envelope.msg_id, channel_id: envelope.channel_id }
        }
    }
}

/// Parses a `read_receipt` raw bus event into its server frame, or `None`
/// for any other/malformed event kind.
fn parse_read_receipt(event: &serde_json::Value) -> Option<ServerFrame> {
    if event.get("event")?.as_str()? != "read_receipt" {
        return None;
    }
    Some(ServerFrame::ReadReceipt {
        user_id: serde_json::from_value::<UserId>(event.get("userId")?.clone()).ok()?,
        channel_id: serde_json::from_value::<ChannelId>(event.get("channelId")?.clone()).ok()?,
        seq_id: serde_json::from_value::<SeqId>(event.get("seqId")?.clone()).ok()?,
    })
}

async fn run(
    mut sub: Subscription,
    mut events: RawSubscription,
    outbound: mpsc::Sender<ServerFrame>,
    overflow: OverflowSignal,
    mut catch_up: Option<oneshot::Receiver<SeqId>>,
) {
    let mut buffered: Vec<(BusEventKind, Envelope)> = Vec::new();
    let mut watermark: Option<SeqId> = if catch_up.is_some() { None } else { Some(SeqId(i64::MIN)) };

    loop {
        tokio::select! {
            biased;

            result = async { catch_up.as_mut().unwrap().await }, if catch_up.is_some() && watermark.is_none() => {
                catch_up = None;
                let mark = result.unwrap_or(SeqId(i64::MIN));
                buffered.retain(|(_, env)| env.seq_id > mark);
                buffered.sort_by_key(|(_, env)| env.seq_id);
                for (kind, env) in buffered.drain(..) {
                    if !try_push(&outbound, &overflow, frame_for(kind, env)) {
                        return;
                    }
                }
                watermark = Some(mark);
            }

            received = sub.recv() => {
                match received {
                    Some(bus_msg) => {
                        if watermark.is_some() {
                            if !try_push(&outbound, &overflow, frame_for(bus_msg.kind, bus_msg.envelope)) {
                                return;
                            }
                        } else {
                            buffered.push((bus_msg.kind, bus_msg.envelope));
                        }
                    }
                    None => return,
                }
            }

            received = events.recv() => {
                match received {
                    Some(event) => {
                        if let Some(frame) = parse_read_receipt(&event) {
                            if !try_push(&outbound, &overflow, frame) {
                                return;
                            }
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_envelope() -> Envelope {
        use chat_core::ids::{MsgId, TenantId};
        use chat_core::message::MessageType;
        Envelope {
            msg_id: MsgId::generate(),
            seq_id: SeqId(1),
            client_msg_id: None,
            channel_id: ChannelId::new_v4(),
            tenant_id: TenantId::new_v4(),
            sender_id: UserId::new_v4(),
            kind: MessageType::Text,
            content: "hi".into(),
            parent_id: None,
            attachments: None,
            metadata: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn frame_for_maps_created_to_message() {
        let envelope = dummy_envelope();
        assert!(matches!(frame_for(BusEventKind::Created, envelope), ServerFrame::Message { .. }));
    }

    #[test]
    fn frame_for_maps_updated_to_message_update() {
        let envelope = dummy_envelope();
        assert!(matches!(frame_for(BusEventKind::Updated, envelope), ServerFrame::MessageUpdate { .. }));
    }

    #[test]
    fn frame_for_maps_deleted_to_message_delete_without_envelope_fields() {
        let envelope = dummy_envelope();
        let msg_id = envelope.msg_id;
        let channel_id = envelope.channel_id;
        match frame_for(BusEventKind::Deleted, envelope) {
            ServerFrame::MessageDelete { msg_id: m, channel_id: c } => {
                assert_eq!(m, msg_id);
                assert_eq!(c, channel_id);
            }
            _ => panic!("expected MessageDelete"),
        }
    }

    #[test]
    fn parses_well_formed_read_receipt_event() {
        let user_id = UserId::new_v4();
        let channel_id = ChannelId::new_v4();
        let event = serde_json::json!({
            "event": "read_receipt",
            "userId": user_id,
            "channelId": channel_id,
            "seqId": 7,
        });
        let frame = parse_read_receipt(&event).expect("should parse");
        match frame {
            ServerFrame::ReadReceipt { user_id: u, channel_id: c, seq_id } => {
                assert_eq!(u, user_id);
                assert_eq!(c, channel_id);
                assert_eq!(seq_id, SeqId(7));
            }
            _ => panic!("expected ReadReceipt"),
        }
    }

    #[test]
    fn ignores_other_event_kinds() {
        let event = serde_json::json!({"event": "something_else"});
        assert!(parse_read_receipt(&event).is_none());
    }

    #[test]
    fn ignores_malformed_read_receipt() {
        let event = serde_json::json!({"event": "read_receipt", "userId": "not-a-uuid"});
        assert!(parse_read_receipt(&event).is_none());
    }
}
