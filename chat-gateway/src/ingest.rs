//! Ingest/Sequencer (C5, spec §4.5) — the transactional write path:
//! dedup -> sequence -> persist message + outbox row -> publish.
//!
//! Grounded on the donor's `Provider::fill_transaction`/`send_transaction`
//! request-assembly shape (`ethers-providers/src/rpc/provider.rs`): one
//! async method per public operation, each a straight-line sequence of
//! awaited steps with `?` propagation, no hidden retries above the layer
//! that owns them (sequence-row contention is handled inside the DB, not
//! here — spec §4.1 "Failure policy").

use std::sync::Arc;
use std::time::Duration;

use chat_core::error::ChatError;
use chat_core::ids::{ChannelId, ClientMsgId, MsgId, SeqId, UserId};
use chat_core::membership::MembershipProvider;
use chat_core::message::{Attachment, Envelope, Message, MessageType};
use chat_core::outbox::OutboxRow;
use chat_providers::bus::{Bus, BusEventKind};
use chat_providers::dedup::DedupCache;
use chat_providers::sequence::{SequenceMode, SequenceService};
use chat_providers::store::{InsertOutcome, PgStore};
use chrono::Utc;
use serde_json::Value;

use crate::rate_limit::RateLimiter;

/// Parameters for `CreateMessage` (spec §4.5 "Public operation").
#[derive(Debug, Clone)]
pub struct CreateMessageRequest {
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageType,
    pub parent_id: Option<MsgId>,
    pub client_msg_id: Option<ClientMsgId>,
    pub metadata: Option<Value>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    Persisted,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct CreateMessageResult {
    pub msg_id: MsgId,
    pub seq_id: SeqId,
    pub status: CreateStatus,
    pub timestamp: chrono::DateTime<Utc>,
}

pub struct Ingest {
    store: Arc<PgStore>,
    sequence: Arc<SequenceService>,
    dedup: Arc<DedupCache>,
    bus: Arc<dyn Bus>,
    membership: Arc<dyn MembershipProvider>,
    rate_limiter: Arc<RateLimiter>,
    ingest_timeout: Duration,
    sequence_mode: SequenceMode,
}

impl Ingest {
    pub fn new(
        store: Arc<PgStore>,
        sequence: Arc<SequenceService>,
        dedup: Arc<DedupCache>,
        bus: Arc<dyn Bus>,
        membership: Arc<dyn MembershipProvider>,
        rate_limiter: Arc<RateLimiter>,
        ingest_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sequence,
            dedup,
            bus,
            membership,
            rate_limiter,
            ingest_timeout,
            sequence_mode: SequenceMode::Tight,
        }
    }

    /// Spec §4.5 steps 1-10, wrapped in the ingest wall-clock budget
    /// (spec §5 "Cancellation & timeouts"). Exceeding the budget aborts
    /// and surfaces `unavailable`; the client may retry with the same
    /// `clientMsgId`.
    pub async fn create_message(&self, req: CreateMessageRequest) -> Result<CreateMessageResult, ChatError> {
        match tokio::time::timeout(self.ingest_timeout, self.create_message_inner(req)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Unavailable("ingest timed out".into())),
        }
    }

    async fn create_message_inner(&self, req: CreateMessageRequest) -> Result<CreateMessageResult, ChatError> {
        validate_content(req.kind, &req.content, &req.attachments)?;

        // Step 1: dedup cache check.
        if let Some(client_msg_id) = req.client_msg_id {
            if let Some(hit) = self.dedup.check(req.channel_id, client_msg_id) {
                return Ok(CreateMessageResult {
                    msg_id: hit.msg_id,
                    seq_id: hit.seq_id,
                    status: CreateStatus::Duplicate,
                    timestamp: Utc::now(),
                });
            }
        }

        // I4: sender must be a current member.
        if !self.membership.is_member(req.channel_id, req.sender_id).await? {
            return Err(ChatError::Forbidden);
        }

        if !self.rate_limiter.try_acquire(req.sender_id) {
            return Err(ChatError::RateLimited);
        }

        if let Some(parent_id) = req.parent_id {
            let parent = self.store.find_by_msg_id(parent_id).await.map_err(ChatError::from)?;
            match parent {
                Some(parent) if parent.channel_id == req.channel_id => {}
                _ => return Err(ChatError::InvalidArgument("parentId must exist in the same channel".into())),
            }
        }

        let tenant_id = self.membership.tenant_of(req.channel_id).await?;

        // Steps 2-7: transactional sequence allocation + message insert.
        let mut tx = self.store.begin().await.map_err(ChatError::from)?;
        let seq_id = self
            .sequence
            .next_seq_in_tx(&mut tx, req.channel_id, self.sequence_mode)
            .await
            .map_err(ChatError::from)?;
        let msg_id = MsgId::generate();
        let created_at = Utc::now();

        let message = Message {
            msg_id,
            channel_id: req.channel_id,
            tenant_id,
            sender_id: req.sender_id,
            content: req.content,
            kind: req.kind,
            parent_id: req.parent_id,
            seq_id,
            client_msg_id: req.client_msg_id,
            attachments: req.attachments,
            metadata: req.metadata,
            created_at,
            edited_at: None,
            is_deleted: false,
        };

        match self.store.insert_message(&mut tx, &message).await.map_err(ChatError::from)? {
            InsertOutcome::Inserted => {}
            InsertOutcome::DuplicateClientMsgId => {
                // Abort this transaction's uncommitted seq allocation and
                // fetch the row that won the race (spec §4.5 step 5).
                drop(tx);
                let client_msg_id = req.client_msg_id.expect("unique violation implies client_msg_id was set");
                let existing = self
                    .store
                    .find_by_client_msg_id(req.channel_id, client_msg_id)
                    .await
                    .map_err(ChatError::from)?
                    .ok_or_else(|| ChatError::Internal("duplicate race but no row found".into()))?;
                self.dedup.record(req.channel_id, client_msg_id, existing.msg_id, existing.seq_id);
                return Ok(CreateMessageResult {
                    msg_id: existing.msg_id,
                    seq_id: existing.seq_id,
                    status: CreateStatus::Duplicate,
                    timestamp: existing.created_at,
                });
            }
        }

        let envelope = message.to_envelope();
        let outbox_row = OutboxRow {
            msg_id,
            channel_id: req.channel_id,
            sender_id: req.sender_id,
            tenant_id,
            payload: envelope.clone(),
            status: chat_core::outbox::OutboxStatus::Pending,
            attempt: 0,
            next_attempt_at: created_at,
            created_at,
            completed_at: None,
        };
        self.store.insert_outbox(&mut tx, &outbox_row).await.map_err(ChatError::from)?;

        tx.commit().await.map_err(chat_providers::error::ProviderError::from)?;

        // Step 8: record in dedup cache (post-commit, so a cache hit
        // always corresponds to a durable row).
        if let Some(client_msg_id) = req.client_msg_id {
            self.dedup.record(req.channel_id, client_msg_id, msg_id, seq_id);
        }

        // Step 9: synchronous fast-path broadcast. Best-effort: if this
        // process dies before the publish lands, the Outbox Processor
        // (C7) republishes when it claims the row (spec §4.5 "Why both
        // Bus publish and outbox").
        self.bus.publish(req.channel_id, BusEventKind::Created, envelope);

        Ok(CreateMessageResult { msg_id, seq_id, status: CreateStatus::Persisted, timestamp: created_at })
    }

    /// SPEC_FULL §11 "Message edit": only the original sender may edit;
    /// does not change `seqId`; broadcasts `message_update`.
    pub async fn edit_message(
        &self,
        msg_id: MsgId,
        sender_id: UserId,
        content: String,
    ) -> Result<Envelope, ChatError> {
        let existing = self.store.find_by_msg_id(msg_id).await.map_err(ChatError::from)?.ok_or(ChatError::NotFound)?;
        if existing.sender_id != sender_id {
            return Err(ChatError::Forbidden);
        }
        let updated = self
            .store
            .edit_message(msg_id, &content, Utc::now())
            .await
            .map_err(ChatError::from)?
            .ok_or(ChatError::NotFound)?;
        let envelope = updated.to_envelope();
        self.bus.publish(updated.channel_id, BusEventKind::Updated, envelope.clone());
        Ok(envelope)
    }

    /// SPEC_FULL §11 "Soft delete": sets `isDeleted`, broadcasts
    /// `message_delete`; the row is retained for the append-only
    /// sequence (I1 must stay gap-free).
    pub async fn delete_message(&self, msg_id: MsgId, sender_id: UserId) -> Result<ChannelId, ChatError> {
        let existing = self.store.find_by_msg_id(msg_id).await.map_err(ChatError::from)?.ok_or(ChatError::NotFound)?;
        if existing.sender_id != sender_id {
            return Err(ChatError::Forbidden);
        }
        let updated = self.store.soft_delete_message(msg_id).await.map_err(ChatError::from)?.ok_or(ChatError::NotFound)?;
        self.bus.publish(updated.channel_id, BusEventKind::Deleted, updated.to_envelope());
        Ok(updated.channel_id)
    }
}

/// Spec §8 boundary case: "Empty content with non-empty attachments:
/// allowed iff type ∈ {file, image}".
fn validate_content(kind: MessageType, content: &str, attachments: &[Attachment]) -> Result<(), ChatError> {
    if content.is_empty() && attachments.is_empty() {
        return Err(ChatError::InvalidArgument("message must have content or an attachment".into()));
    }
    if content.is_empty() && !attachments.is_empty() && !kind.allows_empty_content() {
        return Err(ChatError::InvalidArgument(format!(
            "empty content is only allowed for file/image messages, got {kind:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_requires_content() {
        assert!(validate_content(MessageType::Text, "", &[]).is_err());
    }

    #[test]
    fn file_message_allows_empty_content_with_attachment() {
        let attachment = Attachment {
            file_key: "k".into(),
            file_name: "f.png".into(),
            file_size: 10,
            mime_type: "image/png".into(),
        };
        assert!(validate_content(MessageType::Image, "", &[attachment.clone()]).is_ok());
        assert!(validate_content(MessageType::Text, "", &[attachment]).is_err());
    }
}
