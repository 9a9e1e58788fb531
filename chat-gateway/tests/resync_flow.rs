//! Exercises Resync (C8, spec §4.8) and the Outbox Processor's unread
//! accounting (C7, spec §4.7) against a real Postgres instance —
//! spec §8 scenario 4 ("offline delivery") and the resync pagination law.

use std::sync::Arc;
use std::time::Duration;

use chat_core::ids::{ChannelId, ClientMsgId, SeqId, TenantId, UserId};
use chat_core::membership::StaticMembership;
use chat_core::notify::LoggingPush;
use chat_gateway::ingest::{CreateMessageRequest, Ingest};
use chat_gateway::outbox_processor::OutboxProcessor;
use chat_gateway::rate_limit::RateLimiter;
use chat_gateway::resync;
use chat_core::message::MessageType;
use chat_providers::bus::InProcessBus;
use chat_providers::dedup::DedupCache;
use chat_providers::presence::PresenceRegistry;
use chat_providers::retry::BackoffPolicy;
use chat_providers::sequence::SequenceService;
use chat_providers::store::PgStore;
use sqlx::PgPool;

fn request(channel_id: ChannelId, sender_id: UserId) -> CreateMessageRequest {
    CreateMessageRequest {
        channel_id,
        sender_id,
        content: "hi".to_string(),
        kind: MessageType::Text,
        parent_id: None,
        client_msg_id: Some(ClientMsgId::new_v4()),
        metadata: None,
        attachments: vec![],
    }
}

#[sqlx::test(migrations = "../chat-providers/migrations")]
async fn resync_pages_are_ordered_and_disjoint(pool: PgPool) -> sqlx::Result<()> {
    let channel_id = ChannelId::new_v4();
    let sender = UserId::new_v4();

    let store = Arc::new(PgStore::new(pool.clone()));
    let sequence = Arc::new(SequenceService::new(pool));
    let dedup = Arc::new(DedupCache::new(Duration::from_secs(300)));
    let bus: Arc<dyn chat_providers::bus::Bus> = Arc::new(InProcessBus::new(64));
    let mut membership = StaticMembership::default();
    membership.members_by_channel.insert(channel_id, vec![sender]);
    membership.tenant_by_channel.insert(channel_id, TenantId::new_v4());
    let membership: Arc<dyn chat_core::membership::MembershipProvider> = Arc::new(membership);
    let rate_limiter = Arc::new(RateLimiter::new(1_000, 1_000));

    let ingest =
        Ingest::new(Arc::clone(&store), sequence, dedup, bus, membership, rate_limiter, Duration::from_secs(5));

    for _ in 0..5 {
        ingest.create_message(request(channel_id, sender)).await.unwrap();
    }

    let first_page = resync::resync(&store, channel_id, SeqId(0), 2).await.unwrap();
    assert_eq!(first_page.messages.len(), 2);
    assert!(first_page.has_more);
    let cursor = first_page.next_cursor.unwrap();
    assert_eq!(cursor, SeqId(2));

    let second_page = resync::resync(&store, channel_id, cursor, 2).await.unwrap();
    assert_eq!(second_page.messages.len(), 2);
    assert!(second_page.has_more);

    let third_page = resync::resync(&store, channel_id, second_page.next_cursor.unwrap(), 2).await.unwrap();
    assert_eq!(third_page.messages.len(), 1);
    assert!(!third_page.has_more);

    let all_seqs: Vec<_> = first_page
        .messages
        .iter()
        .chain(second_page.messages.iter())
        .chain(third_page.messages.iter())
        .map(|m| m.seq_id)
        .collect();
    assert_eq!(all_seqs, vec![SeqId(1), SeqId(2), SeqId(3), SeqId(4), SeqId(5)]);
    Ok(())
}

#[sqlx::test(migrations = "../chat-providers/migrations")]
async fn offline_recipient_gets_unread_increment_via_outbox(pool: PgPool) -> sqlx::Result<()> {
    let channel_id = ChannelId::new_v4();
    let sender = UserId::new_v4();
    let offline_recipient = UserId::new_v4();

    let store = Arc::new(PgStore::new(pool.clone()));
    let sequence = Arc::new(SequenceService::new(pool));
    let dedup = Arc::new(DedupCache::new(Duration::from_secs(300)));
    let bus: Arc<dyn chat_providers::bus::Bus> = Arc::new(InProcessBus::new(64));
    let mut membership = StaticMembership::default();
    membership.members_by_channel.insert(channel_id, vec![sender, offline_recipient]);
    membership.tenant_by_channel.insert(channel_id, TenantId::new_v4());
    let membership: Arc<dyn chat_core::membership::MembershipProvider> = Arc::new(membership);
    let rate_limiter = Arc::new(RateLimiter::new(1_000, 1_000));
    let presence = Arc::new(PresenceRegistry::new());

    let ingest = Ingest::new(
        Arc::clone(&store),
        sequence,
        dedup,
        Arc::clone(&bus),
        Arc::clone(&membership),
        rate_limiter,
        Duration::from_secs(5),
    );
    ingest.create_message(request(channel_id, sender)).await.unwrap();

    let processor = Arc::new(OutboxProcessor::new(
        Arc::clone(&store),
        bus,
        presence,
        membership,
        Arc::new(LoggingPush),
        BackoffPolicy::default(),
        64,
    ));
    let workers = processor.spawn_workers(1);

    let mut unread = 0;
    for _ in 0..50 {
        unread = store.unread_count(offline_recipient, channel_id).await.unwrap();
        if unread > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for worker in workers {
        worker.abort();
    }

    assert_eq!(unread, 1);
    Ok(())
}
