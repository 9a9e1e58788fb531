//! Sequence Service (spec §4.1 / C1): issues per-channel monotonic
//! `seqId`s. The only mode fully exercised is `Tight` — the durable
//! counter row is incremented inside the same transaction that writes the
//! message, so the counter and the row commit atomically and I1 (no gaps)
//! holds unconditionally.
//!
//! `Batched` is represented so the type carries the documented relaxation
//! of I1 (SPEC_FULL §12 open-question decision), but no range-lease
//! allocator is implemented — a half-built batched mode would be worse
//! than an honest "not supported yet".

use chat_core::ids::{ChannelId, SeqId};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::ProviderError;

/// Per-channel allocation policy (spec §4.1). `Tight` is the default and
/// the only mode the shipped `SequenceService` executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    /// `UPDATE … RETURNING next_seq`, executed inside the caller's
    /// transaction. No gaps even under failure.
    Tight,
    /// Reserve a block of N ids under a lease; relaxes I1 to
    /// "monotonic but possibly sparse" if the process dies with unused
    /// ids in the block. Not implemented — see module docs.
    Batched { block_size: u32 },
}

/// Durable per-channel counter, backed by `channels_seq(channel_id PK,
/// next_seq bigint)` (spec §6 "Persisted layout").
pub struct SequenceService {
    pool: PgPool,
}

impl SequenceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazily creates the counter row for a channel that has never sent a
    /// message, seeded at 0 so the first `next_seq` call returns 1.
    pub async fn ensure_channel(&self, channel_id: ChannelId) -> Result<(), ProviderError> {
        sqlx::query(
            "INSERT INTO channels_seq (channel_id, next_seq) VALUES ($1, 0)
             ON CONFLICT (channel_id) DO NOTHING",
        )
        .bind(channel_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Allocates the next `seqId` for `channel_id`, row-locked within
    /// `tx` (spec §4.1 "Tight" mode). The caller must commit `tx` in the
    /// same transaction that writes the message row — that pairing is
    /// what makes I1 hold.
    pub async fn next_seq_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        channel_id: ChannelId,
        mode: SequenceMode,
    ) -> Result<SeqId, ProviderError> {
        match mode {
            SequenceMode::Tight => {
                let row: Option<(i64,)> = sqlx::query_as(
                    "UPDATE channels_seq SET next_seq = next_seq + 1
                     WHERE channel_id = $1
                     RETURNING next_seq",
                )
                .bind(channel_id.as_uuid())
                .fetch_optional(&mut **tx)
                .await?;

                let next = match row {
                    Some((n,)) => n,
                    // Channel has never been seeded; insert-and-retry once.
                    // Races here are resolved by the unique PK: the loser's
                    // INSERT fails and it retries the UPDATE, which now
                    // succeeds against the winner's row.
                    None => {
                        // Seed at 0, matching `ensure_channel`'s convention,
                        // so the UPDATE below is what actually allocates
                        // the first seqId (1) rather than skipping it.
                        sqlx::query(
                            "INSERT INTO channels_seq (channel_id, next_seq) VALUES ($1, 0)
                             ON CONFLICT (channel_id) DO NOTHING",
                        )
                        .bind(channel_id.as_uuid())
                        .execute(&mut **tx)
                        .await?;

                        let (n,): (i64,) = sqlx::query_as(
                            "UPDATE channels_seq SET next_seq = next_seq + 1
                             WHERE channel_id = $1
                             RETURNING next_seq",
                        )
                        .bind(channel_id.as_uuid())
                        .fetch_one(&mut **tx)
                        .await?;
                        n
                    }
                };
                Ok(SeqId(next))
            }
            SequenceMode::Batched { .. } => {
                Err(ProviderError::UnsupportedSequenceMode("batched allocation is not implemented"))
            }
        }
    }

    /// Current high-water mark for a channel, for diagnostics/Resync
    /// bounds-checking. Does not allocate.
    pub async fn current_seq(&self, channel_id: ChannelId) -> Result<SeqId, ProviderError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT next_seq FROM channels_seq WHERE channel_id = $1")
                .bind(channel_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(SeqId(row.map(|(n,)| n).unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_mode_is_a_documented_non_implementation() {
        let mode = SequenceMode::Batched { block_size: 100 };
        assert_eq!(mode, SequenceMode::Batched { block_size: 100 });
        assert_ne!(mode, SequenceMode::Tight);
    }
}
