//! End-to-end exercises of the Ingest/Sequencer (C5) against a real
//! Postgres instance, covering the concrete scenarios from spec §8:
//! basic send, idempotent retry, and concurrent producers. Each test
//! gets its own ephemeral database via `#[sqlx::test]`, migrated from
//! `chat-providers`' schema (spec §6 "Persisted layout").

use std::sync::Arc;
use std::time::Duration;

use chat_core::ids::{ChannelId, ClientMsgId, TenantId, UserId};
use chat_core::membership::StaticMembership;
use chat_core::message::MessageType;
use chat_gateway::ingest::{CreateMessageRequest, CreateStatus, Ingest};
use chat_gateway::rate_limit::RateLimiter;
use chat_providers::bus::InProcessBus;
use chat_providers::dedup::DedupCache;
use chat_providers::sequence::SequenceService;
use chat_providers::store::PgStore;
use sqlx::PgPool;

fn request(channel_id: ChannelId, sender_id: UserId, client_msg_id: Option<ClientMsgId>) -> CreateMessageRequest {
    CreateMessageRequest {
        channel_id,
        sender_id,
        content: "hi".to_string(),
        kind: MessageType::Text,
        parent_id: None,
        client_msg_id,
        metadata: None,
        attachments: vec![],
    }
}

fn build_ingest(pool: PgPool, channel_id: ChannelId, members: Vec<UserId>) -> Ingest {
    let store = Arc::new(PgStore::new(pool.clone()));
    let sequence = Arc::new(SequenceService::new(pool));
    let dedup = Arc::new(DedupCache::new(Duration::from_secs(300)));
    let bus: Arc<dyn chat_providers::bus::Bus> = Arc::new(InProcessBus::new(64));

    let mut membership = StaticMembership::default();
    membership.members_by_channel.insert(channel_id, members);
    membership.tenant_by_channel.insert(channel_id, TenantId::new_v4());
    let membership: Arc<dyn chat_core::membership::MembershipProvider> = Arc::new(membership);

    let rate_limiter = Arc::new(RateLimiter::new(1_000, 1_000));

    Ingest::new(store, sequence, dedup, bus, membership, rate_limiter, Duration::from_secs(5))
}

#[sqlx::test(migrations = "../chat-providers/migrations")]
async fn basic_send_assigns_seq_one_and_broadcasts(pool: PgPool) -> sqlx::Result<()> {
    let channel_id = ChannelId::new_v4();
    let sender = UserId::new_v4();
    let recipient = UserId::new_v4();
    let ingest = build_ingest(pool, channel_id, vec![sender, recipient]);

    let result = ingest.create_message(request(channel_id, sender, Some(ClientMsgId::new_v4()))).await.unwrap();

    assert_eq!(result.seq_id, chat_core::ids::SeqId(1));
    assert_eq!(result.status, CreateStatus::Persisted);
    Ok(())
}

#[sqlx::test(migrations = "../chat-providers/migrations")]
async fn retry_with_same_client_msg_id_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
    let channel_id = ChannelId::new_v4();
    let sender = UserId::new_v4();
    let ingest = build_ingest(pool, channel_id, vec![sender]);
    let client_msg_id = ClientMsgId::new_v4();

    let first = ingest.create_message(request(channel_id, sender, Some(client_msg_id))).await.unwrap();
    assert_eq!(first.status, CreateStatus::Persisted);

    let second = ingest.create_message(request(channel_id, sender, Some(client_msg_id))).await.unwrap();
    assert_eq!(second.status, CreateStatus::Duplicate);
    assert_eq!(second.msg_id, first.msg_id);
    assert_eq!(second.seq_id, first.seq_id);
    Ok(())
}

#[sqlx::test(migrations = "../chat-providers/migrations")]
async fn concurrent_producers_get_distinct_gap_free_seq_ids(pool: PgPool) -> sqlx::Result<()> {
    let channel_id = ChannelId::new_v4();
    let a = UserId::new_v4();
    let b = UserId::new_v4();
    let ingest = Arc::new(build_ingest(pool, channel_id, vec![a, b]));

    let ingest_a = Arc::clone(&ingest);
    let ingest_b = Arc::clone(&ingest);
    let (r1, r2) = tokio::join!(
        ingest_a.create_message(request(channel_id, a, Some(ClientMsgId::new_v4()))),
        ingest_b.create_message(request(channel_id, b, Some(ClientMsgId::new_v4()))),
    );
    let mut seqs = vec![r1.unwrap().seq_id, r2.unwrap().seq_id];
    seqs.sort();

    assert_eq!(seqs, vec![chat_core::ids::SeqId(1), chat_core::ids::SeqId(2)]);
    Ok(())
}

#[sqlx::test(migrations = "../chat-providers/migrations")]
async fn non_member_sender_is_forbidden(pool: PgPool) -> sqlx::Result<()> {
    let channel_id = ChannelId::new_v4();
    let member = UserId::new_v4();
    let outsider = UserId::new_v4();
    let ingest = build_ingest(pool, channel_id, vec![member]);

    let err = ingest.create_message(request(channel_id, outsider, None)).await.unwrap_err();
    assert_eq!(err, chat_core::ChatError::Forbidden);
    Ok(())
}

#[sqlx::test(migrations = "../chat-providers/migrations")]
async fn empty_content_without_attachment_is_rejected(pool: PgPool) -> sqlx::Result<()> {
    let channel_id = ChannelId::new_v4();
    let sender = UserId::new_v4();
    let ingest = build_ingest(pool, channel_id, vec![sender]);

    let mut req = request(channel_id, sender, None);
    req.content.clear();
    let err = ingest.create_message(req).await.unwrap_err();
    assert!(matches!(err, chat_core::ChatError::InvalidArgument(_)));
    Ok(())
}
