//! SQL-backed storage shared by Ingest (C5), the Outbox Processor (C7),
//! and Resync (C8) — spec §3 "Persisted layout" and §6.
//!
//! Grounded on the donor's `Provider<P>` (`ethers-providers/src/rpc/provider.rs`):
//! one struct wrapping a single backing connection, with narrow,
//! single-purpose methods rather than a generic query builder. Postgres
//! is the concrete backend (`sqlx`), chosen the way the donor picks one
//! concrete JSON-RPC transport per `Provider` instantiation.

use chat_core::ids::{ChannelId, ClientMsgId, MsgId, SeqId, TenantId, UserId};
use chat_core::message::{Attachment, Message, MessageType};
use chat_core::outbox::{OutboxRow, OutboxStatus};
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::ProviderError;

/// Advisory-lock namespace (the `classid` half of the two-key
/// `pg_advisory_lock(classid, objid)` form) reserved for per-channel
/// outbox-processing affinity, so this usage can never collide with an
/// advisory lock taken for an unrelated purpose elsewhere.
const OUTBOX_CHANNEL_LOCK_NAMESPACE: i32 = 0x4F_42_58; // "OBX"

/// Postgres-backed store for `messages`, `outbox`, and `unread_cursor`
/// (spec §6). `channels_seq` is owned by [`crate::sequence::SequenceService`]
/// but allocated inside the same transaction this store opens for a
/// message write, per spec §4.1's tight-mode requirement.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// What `insert_message` found when it tried to commit a row (spec §4.5
/// step 5: "On unique-violation on (channelId, clientMsgId): abort, fetch
/// existing, return as duplicate").
pub enum InsertOutcome {
    Inserted,
    /// `(channelId, clientMsgId)` already existed; caller should fetch
    /// the existing row and report `status = duplicate`.
    DuplicateClientMsgId,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// One channel's exclusively-claimed outbox backlog (spec §4.7), plus
/// the pool connection that holds the session-scoped advisory lock
/// granting that exclusivity. Dropping this without going through
/// [`PgStore::release_channel_lock`] still releases the lock when
/// Postgres closes the session, but leaves the channel unclaimable until
/// the connection is reaped — callers must release explicitly.
pub struct ClaimedChannelBatch {
    conn: PoolConnection<Postgres>,
    pub channel_id: ChannelId,
    pub rows: Vec<OutboxRow>,
}

async fn unlock_channel(conn: &mut PoolConnection<Postgres>, channel_uuid: uuid::Uuid) -> Result<(), ProviderError> {
    sqlx::query("SELECT pg_advisory_unlock($1, hashtext($2))")
        .bind(OUTBOX_CHANNEL_LOCK_NAMESPACE)
        .bind(channel_uuid.to_string())
        .execute(&mut **conn)
        .await?;
    Ok(())
}

fn row_to_message(row: sqlx::postgres::PgRow) -> Result<Message, ProviderError> {
    let kind_str: String = row.try_get("type")?;
    let kind = match kind_str.as_str() {
        "text" => MessageType::Text,
        "file" => MessageType::File,
        "image" => MessageType::Image,
        "system" => MessageType::System,
        other => {
            return Err(ProviderError::Decode(format!("unknown message type {other}")))
        }
    };
    let attachments_json: Option<serde_json::Value> = row.try_get("attachments")?;
    let attachments: Vec<Attachment> = attachments_json
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    Ok(Message {
        msg_id: MsgId(row.try_get("msg_id")?),
        channel_id: ChannelId(row.try_get("channel_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        content: row.try_get("content")?,
        kind,
        parent_id: row.try_get::<Option<uuid::Uuid>, _>("parent_id")?.map(MsgId),
        seq_id: SeqId(row.try_get("seq_id")?),
        client_msg_id: row.try_get::<Option<uuid::Uuid>, _>("client_msg_id")?.map(ClientMsgId),
        attachments,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        edited_at: row.try_get("edited_at")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

fn row_to_outbox(row: sqlx::postgres::PgRow) -> Result<OutboxRow, ProviderError> {
    let status_str: String = row.try_get("status")?;
    let status = match status_str.as_str() {
        "pending" => OutboxStatus::Pending,
        "broadcasting" => OutboxStatus::Broadcasting,
        "delivered" => OutboxStatus::Delivered,
        "done" => OutboxStatus::Done,
        "failed" => OutboxStatus::Failed,
        other => return Err(ProviderError::Decode(format!("unknown outbox status {other}"))),
    };
    let payload: serde_json::Value = row.try_get("payload")?;
    Ok(OutboxRow {
        msg_id: MsgId(row.try_get("msg_id")?),
        channel_id: ChannelId(row.try_get("channel_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        payload: serde_json::from_value(payload)?,
        status,
        attempt: row.try_get("attempt")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, ProviderError> {
        Ok(self.pool.begin().await?)
    }

    /// Runs the embedded migrations (spec §6 "Persisted layout").
    pub async fn run_migrations(&self) -> Result<(), ProviderError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Inserts the message row within `tx` (spec §4.5 step 5). Translates
    /// a `(channelId, clientMsgId)` unique violation into
    /// [`InsertOutcome::DuplicateClientMsgId`] rather than propagating the
    /// raw database error — that conflict is an expected, recoverable
    /// outcome, not a failure.
    pub async fn insert_message(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        msg: &Message,
    ) -> Result<InsertOutcome, ProviderError> {
        let kind = match msg.kind {
            MessageType::Text => "text",
            MessageType::File => "file",
            MessageType::Image => "image",
            MessageType::System => "system",
        };
        let attachments = serde_json::to_value(&msg.attachments)?;
        let result = sqlx::query(
            "INSERT INTO messages
                (msg_id, channel_id, tenant_id, sender_id, content, type, parent_id,
                 seq_id, client_msg_id, attachments, metadata, created_at, edited_at, is_deleted)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
        )
        .bind(msg.msg_id.as_uuid())
        .bind(msg.channel_id.as_uuid())
        .bind(msg.tenant_id.as_uuid())
        .bind(msg.sender_id.as_uuid())
        .bind(&msg.content)
        .bind(kind)
        .bind(msg.parent_id.map(|p| p.as_uuid()))
        .bind(msg.seq_id.0)
        .bind(msg.client_msg_id.map(|c| c.as_uuid()))
        .bind(attachments)
        .bind(&msg.metadata)
        .bind(msg.created_at)
        .bind(msg.edited_at)
        .bind(msg.is_deleted)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::DuplicateClientMsgId),
            Err(err) => Err(err.into()),
        }
    }

    /// Inserts the paired outbox row (spec §4.5 step 6), in the same
    /// transaction as the message.
    pub async fn insert_outbox(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &OutboxRow,
    ) -> Result<(), ProviderError> {
        let payload = serde_json::to_value(&row.payload)?;
        sqlx::query(
            "INSERT INTO outbox
                (msg_id, channel_id, seq_id, sender_id, tenant_id, payload, status, attempt,
                 next_attempt_at, created_at, completed_at)
             VALUES ($1,$2,$3,$4,$5,$6,'pending',0,$7,$8,NULL)",
        )
        .bind(row.msg_id.as_uuid())
        .bind(row.channel_id.as_uuid())
        .bind(row.payload.seq_id.0)
        .bind(row.sender_id.as_uuid())
        .bind(row.tenant_id.as_uuid())
        .bind(payload)
        .bind(row.next_attempt_at)
        .bind(row.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Fetches the message that won a `(channelId, clientMsgId)` race, for
    /// reporting back as `status = duplicate` (spec §4.5 step 5, §7).
    pub async fn find_by_client_msg_id(
        &self,
        channel_id: ChannelId,
        client_msg_id: ClientMsgId,
    ) -> Result<Option<Message>, ProviderError> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = $1 AND client_msg_id = $2",
        )
        .bind(channel_id.as_uuid())
        .bind(client_msg_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_message).transpose()
    }

    pub async fn find_by_msg_id(&self, msg_id: MsgId) -> Result<Option<Message>, ProviderError> {
        let row = sqlx::query("SELECT * FROM messages WHERE msg_id = $1")
            .bind(msg_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_message).transpose()
    }

    /// Edits a message's content in place (SPEC_FULL §11 "Message edit").
    /// Only the original sender may edit; enforced by the caller checking
    /// `sender_id` before calling this.
    pub async fn edit_message(
        &self,
        msg_id: MsgId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<Option<Message>, ProviderError> {
        let row = sqlx::query(
            "UPDATE messages SET content = $2, edited_at = $3
             WHERE msg_id = $1 AND is_deleted = FALSE
             RETURNING *",
        )
        .bind(msg_id.as_uuid())
        .bind(content)
        .bind(edited_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_message).transpose()
    }

    /// Soft-deletes a message (SPEC_FULL §11): content is blanked on
    /// projection (see `Message::to_envelope`), the row itself is kept.
    pub async fn soft_delete_message(&self, msg_id: MsgId) -> Result<Option<Message>, ProviderError> {
        let row = sqlx::query(
            "UPDATE messages SET is_deleted = TRUE WHERE msg_id = $1 RETURNING *",
        )
        .bind(msg_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_message).transpose()
    }

    /// Ordered page of messages with `seqId > after_seq`, used by Resync
    /// (spec §4.8) and `GET .../messages?afterSeq=`.
    pub async fn messages_after(
        &self,
        channel_id: ChannelId,
        after_seq: SeqId,
        limit: i64,
    ) -> Result<Vec<Message>, ProviderError> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE channel_id = $1 AND seq_id > $2
             ORDER BY seq_id ASC
             LIMIT $3",
        )
        .bind(channel_id.as_uuid())
        .bind(after_seq.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_message).collect()
    }

    /// Claims exclusive ownership of one channel's due outbox backlog
    /// (spec §4.7: "partitioned by `channelId` so a single worker owns a
    /// channel at a time", "drains ... in `seqId` order per channel").
    ///
    /// A session-scoped Postgres advisory lock keyed on the channel is
    /// held on the returned connection for as long as the
    /// [`ClaimedChannelBatch`] is alive — not just for the claiming
    /// transaction — so no other worker can claim rows for the same
    /// channel until [`PgStore::release_channel_lock`] is called, however
    /// long this worker takes to process the batch (membership lookups,
    /// unread upserts, push enqueues). Without that affinity, two workers
    /// could hold rows of the same channel concurrently and apply them to
    /// `unread_cursor` out of `seqId` order; `apply_unread_increment`'s
    /// watermark guard would then silently drop the out-of-order ones
    /// instead of reordering them.
    ///
    /// Returns `Ok(None)` if every channel with due rows is currently
    /// locked by another worker, or there is no due work at all.
    pub async fn claim_channel_batch(&self, limit: i64) -> Result<Option<ClaimedChannelBatch>, ProviderError> {
        let mut conn = self.pool.acquire().await?;

        let candidates: Vec<(uuid::Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT channel_id FROM outbox
             WHERE status = 'pending' AND next_attempt_at <= now()
             ORDER BY channel_id",
        )
        .fetch_all(&mut *conn)
        .await?;

        for (channel_uuid,) in candidates {
            let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1, hashtext($2))")
                .bind(OUTBOX_CHANNEL_LOCK_NAMESPACE)
                .bind(channel_uuid.to_string())
                .fetch_one(&mut *conn)
                .await?;
            if !locked {
                // Another worker already owns this channel; try the next.
                continue;
            }

            let rows = sqlx::query(
                "UPDATE outbox SET status = 'broadcasting'
                 WHERE msg_id IN (
                     SELECT msg_id FROM outbox
                     WHERE channel_id = $1 AND status = 'pending' AND next_attempt_at <= now()
                     ORDER BY seq_id
                     LIMIT $2
                     FOR UPDATE SKIP LOCKED
                 )
                 RETURNING *",
            )
            .bind(channel_uuid)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;

            if rows.is_empty() {
                // Another worker drained this channel's backlog between
                // our candidate scan and taking the lock. Release and
                // keep looking rather than holding an idle lock.
                unlock_channel(&mut conn, channel_uuid).await?;
                continue;
            }

            let claimed = rows.into_iter().map(row_to_outbox).collect::<Result<Vec<_>, _>>()?;
            return Ok(Some(ClaimedChannelBatch { conn, channel_id: ChannelId(channel_uuid), rows: claimed }));
        }

        Ok(None)
    }

    /// Releases the advisory lock a [`ClaimedChannelBatch`] holds,
    /// freeing the channel for the next worker to claim. Must be called
    /// exactly once per successful `claim_channel_batch`, after this
    /// worker has finished (or deliberately stopped partway through, per
    /// spec §4.7's ordering requirement) processing the batch.
    pub async fn release_channel_lock(&self, mut claimed: ClaimedChannelBatch) -> Result<(), ProviderError> {
        unlock_channel(&mut claimed.conn, claimed.channel_id.as_uuid()).await
    }

    /// Reverts rows this worker claimed but did not attempt, back to
    /// `pending` untouched (no attempt/backoff change — they were never
    /// actually tried). Used when an earlier row in the same channel's
    /// batch failed: processing stops there to preserve per-channel
    /// `seqId` order, and the remaining already-`broadcasting` rows must
    /// not be left stuck.
    pub async fn revert_unclaimed_rows(&self, msg_ids: &[MsgId]) -> Result<(), ProviderError> {
        if msg_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<uuid::Uuid> = msg_ids.iter().map(|m| m.as_uuid()).collect();
        sqlx::query("UPDATE outbox SET status = 'pending' WHERE msg_id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks an outbox row `done` (spec §4.7 step 4).
    pub async fn complete_outbox(&self, msg_id: MsgId, completed_at: DateTime<Utc>) -> Result<(), ProviderError> {
        sqlx::query("UPDATE outbox SET status = 'done', completed_at = $2 WHERE msg_id = $1")
            .bind(msg_id.as_uuid())
            .bind(completed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Re-enters `pending` with incremented attempt and backed-off
    /// `nextAttemptAt`, or transitions to `failed` once the retry budget
    /// is exhausted (spec §4.7 "Backoff").
    pub async fn retry_or_fail_outbox(
        &self,
        msg_id: MsgId,
        next_attempt: i32,
        next_attempt_at: DateTime<Utc>,
        failed: bool,
    ) -> Result<(), ProviderError> {
        if failed {
            sqlx::query("UPDATE outbox SET status = 'failed', attempt = $2 WHERE msg_id = $1")
                .bind(msg_id.as_uuid())
                .bind(next_attempt)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                "UPDATE outbox SET status = 'pending', attempt = $2, next_attempt_at = $3
                 WHERE msg_id = $1",
            )
            .bind(msg_id.as_uuid())
            .bind(next_attempt)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Upserts `unread_cursor`'s watermark-guarded increment (spec §4.7
    /// "Idempotence": "guarded by a (userId, channelId, lastAppliedMsgId)
    /// watermark — the processor applies only messages with seqId >
    /// watermark"). `msg_seq` is the message's `seqId`, used as the
    /// monotonic watermark comparator so replays of the same outbox row
    /// never double-increment.
    pub async fn apply_unread_increment(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        msg_id: MsgId,
        msg_seq: SeqId,
    ) -> Result<(), ProviderError> {
        sqlx::query(
            "INSERT INTO unread_cursor (user_id, channel_id, last_read_seq_id, unread_count, last_applied_seq_id)
             VALUES ($1, $2, 0, 1, $3)
             ON CONFLICT (user_id, channel_id) DO UPDATE SET
                unread_count = unread_cursor.unread_count + 1,
                last_applied_seq_id = $3
             WHERE unread_cursor.last_applied_seq_id < $3",
        )
        .bind(user_id.as_uuid())
        .bind(channel_id.as_uuid())
        .bind(msg_seq.0)
        .execute(&self.pool)
        .await?;
        let _ = msg_id;
        Ok(())
    }

    /// `ack {read}` handling (spec §4.6, §8 "idempotence law"): advances
    /// `lastReadSeqId` but never moves it backward.
    pub async fn mark_read(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        seq_id: SeqId,
    ) -> Result<(), ProviderError> {
        sqlx::query(
            "INSERT INTO unread_cursor (user_id, channel_id, last_read_seq_id, unread_count, last_applied_seq_id)
             VALUES ($1, $2, $3, 0, 0)
             ON CONFLICT (user_id, channel_id) DO UPDATE SET
                last_read_seq_id = GREATEST(unread_cursor.last_read_seq_id, $3),
                unread_count = GREATEST(0, unread_cursor.unread_count - GREATEST(0, $3 - unread_cursor.last_read_seq_id))
             ",
        )
        .bind(user_id.as_uuid())
        .bind(channel_id.as_uuid())
        .bind(seq_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unread_count(&self, user_id: UserId, channel_id: ChannelId) -> Result<i64, ProviderError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT unread_count FROM unread_cursor WHERE user_id = $1 AND channel_id = $2",
        )
        .bind(user_id.as_uuid())
        .bind(channel_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(n,)| n).unwrap_or(0))
    }
}
