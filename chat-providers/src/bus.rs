//! Pub/Sub Bus (spec §4.4): fire-and-forget, topic-keyed (`ch:<channelId>`)
//! fan-out across the gateway fleet. Not a durable queue — the Outbox
//! (§4.7) is the durable path; this is purely a latency optimization.
//!
//! The shape follows the donor's `PubsubClient` trait
//! (`ethers-providers/src/pubsub.rs`): a small trait that hands back a
//! `Stream` for a subscription, plus an explicit unsubscribe. The
//! concrete, in-process implementation keeps one `tokio::sync::broadcast`
//! channel per topic in a `DashMap`, created lazily the way the donor's
//! `RequestManager` lazily creates subscription entries.

use async_trait::async_trait;
use chat_core::ids::ChannelId;
use chat_core::message::Envelope;
use dashmap::DashMap;
use tokio::sync::broadcast;

pub fn topic_for(channel_id: ChannelId) -> String {
    format!("ch:{channel_id}")
}

/// What kind of change an [`Envelope`] on the message topic represents.
/// Spec §4.6 gives these three distinct server frames (`message`,
/// `message_update`, `message_delete`); the Bus needs to carry the same
/// distinction end to end so the forwarder can pick the right one instead
/// of flattening edits and deletes into brand-new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub kind: BusEventKind,
    pub envelope: Envelope,
}

/// A subscription handle. Dropping it does not unsubscribe by itself
/// (unlike the donor's `SubscriptionStream`, which unsubscribes on
/// `Drop`) because `broadcast::Receiver` has no server-side state to
/// clean up — the channel is simply garbage once all receivers are gone.
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                // A slow subscriber lagged and missed messages. The Bus
                // makes no durability promise (spec §4.4); the caller
                // resyncs via the Outbox/Resync path to catch up.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A raw, topic-keyed JSON event — used for ambient fan-out that isn't a
/// message envelope (SPEC_FULL §11 "Read-receipt fan-out": the `ack
/// {read}` frame publishes a lightweight `read_receipt` event other
/// online members can render, additive UX the distillation's Non-goals
/// don't exclude). Kept separate from [`BusMessage`]/[`Envelope`] so the
/// correctness-critical message fan-out path never has to branch on
/// payload kind.
pub struct RawSubscription {
    rx: broadcast::Receiver<serde_json::Value>,
}

impl RawSubscription {
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish. No acknowledgement (spec §5). `kind`
    /// distinguishes a brand-new message from an edit or soft-delete of an
    /// existing one so subscribers can forward the right `ServerFrame`.
    fn publish(&self, channel_id: ChannelId, kind: BusEventKind, envelope: Envelope);

    /// Cooperative subscribe: each gateway joins a channel's topic lazily
    /// when it holds a connection for a member (spec §4.4).
    fn subscribe(&self, channel_id: ChannelId) -> Subscription;

    /// Publishes an arbitrary JSON event on a channel's topic, for
    /// ambient fan-out that isn't a message broadcast (e.g. read
    /// receipts).
    fn publish_event(&self, channel_id: ChannelId, event: serde_json::Value);

    /// Subscribes to the raw event stream for a channel (read receipts
    /// and any future non-message ambient events).
    fn subscribe_events(&self, channel_id: ChannelId) -> RawSubscription;
}

/// In-process implementation. Suitable for a single gateway instance or as
/// the local fan-out stage beneath a cross-process transport; swapping in
/// a Redis/NATS-backed `Bus` for multi-instance fleets only requires a new
/// impl of this trait (spec §9 "Redis-backed presence... replaceable").
pub struct InProcessBus {
    topics: DashMap<String, broadcast::Sender<BusMessage>>,
    event_topics: DashMap<String, broadcast::Sender<serde_json::Value>>,
    capacity: usize,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        Self { topics: DashMap::new(), event_topics: DashMap::new(), capacity }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn event_sender_for(&self, topic: &str) -> broadcast::Sender<serde_json::Value> {
        self.event_topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Bus for InProcessBus {
    fn publish(&self, channel_id: ChannelId, kind: BusEventKind, envelope: Envelope) {
        let topic = topic_for(channel_id);
        let sender = self.sender_for(&topic);
        // No receivers is not an error: Bus publish has no ack (spec §5).
        let _ = sender.send(BusMessage { topic, kind, envelope });
    }

    fn subscribe(&self, channel_id: ChannelId) -> Subscription {
        let topic = topic_for(channel_id);
        let sender = self.sender_for(&topic);
        Subscription { rx: sender.subscribe() }
    }

    fn publish_event(&self, channel_id: ChannelId, event: serde_json::Value) {
        let topic = topic_for(channel_id);
        let sender = self.event_sender_for(&topic);
        let _ = sender.send(event);
    }

    fn subscribe_events(&self, channel_id: ChannelId) -> RawSubscription {
        let topic = topic_for(channel_id);
        let sender = self.event_sender_for(&topic);
        RawSubscription { rx: sender.subscribe() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::ids::{MsgId, SeqId, TenantId, UserId};
    use chat_core::message::MessageType;
    use chrono::Utc;

    fn dummy_envelope(channel_id: ChannelId, seq: i64) -> Envelope {
        Envelope {
            msg_id: MsgId::generate(),
            seq_id: SeqId(seq),
            client_msg_id: None,
            channel_id,
            tenant_id: TenantId::new_v4(),
            sender_id: UserId::new_v4(),
            kind: MessageType::Text,
            content: "hi".into(),
            parent_id: None,
            attachments: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_envelope() {
        let bus = InProcessBus::new(16);
        let channel = ChannelId::new_v4();
        let mut sub = bus.subscribe(channel);

        bus.publish(channel, BusEventKind::Created, dummy_envelope(channel, 1));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.envelope.seq_id, SeqId(1));
        assert_eq!(received.topic, topic_for(channel));
        assert_eq!(received.kind, BusEventKind::Created);
    }

    #[tokio::test]
    async fn subscribers_on_other_channels_do_not_receive() {
        let bus = InProcessBus::new(16);
        let channel_a = ChannelId::new_v4();
        let channel_b = ChannelId::new_v4();
        let mut sub_b = bus.subscribe(channel_b);

        bus.publish(channel_a, BusEventKind::Created, dummy_envelope(channel_a, 1));

        let outcome = tokio::time::timeout(std::time::Duration::from_millis(50), sub_b.recv()).await;
        assert!(outcome.is_err(), "subscriber on channel_b should not receive channel_a's publish");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = InProcessBus::new(16);
        let channel = ChannelId::new_v4();
        bus.publish(channel, BusEventKind::Created, dummy_envelope(channel, 1));
    }

    #[tokio::test]
    async fn publish_carries_update_and_delete_kinds() {
        let bus = InProcessBus::new(16);
        let channel = ChannelId::new_v4();
        let mut sub = bus.subscribe(channel);

        bus.publish(channel, BusEventKind::Updated, dummy_envelope(channel, 2));
        bus.publish(channel, BusEventKind::Deleted, dummy_envelope(channel, 3));

        assert_eq!(sub.recv().await.unwrap().kind, BusEventKind::Updated);
        assert_eq!(sub.recv().await.unwrap().kind, BusEventKind::Deleted);
    }

    #[tokio::test]
    async fn raw_events_are_independent_of_message_topic() {
        let bus = InProcessBus::new(16);
        let channel = ChannelId::new_v4();
        let mut events = bus.subscribe_events(channel);
        let mut messages = bus.subscribe(channel);

        bus.publish_event(channel, serde_json::json!({"kind": "read_receipt"}));

        let event = events.recv().await.unwrap();
        assert_eq!(event["kind"], "read_receipt");

        let outcome = tokio::time::timeout(std::time::Duration::from_millis(30), messages.recv()).await;
        assert!(outcome.is_err(), "a raw event must not appear on the message subscription");
    }
}
