//! Outbox Processor (C7, spec §4.7): drains the `outbox` table, finalizes
//! delivery — unread accounting, offline push enqueue, outbox
//! completion — independent of whether C5's synchronous Bus publish
//! landed.
//!
//! Grounded on the donor's `PendingTransaction`/escalator poll loop
//! (`ethers-providers/src/pending_escalator.rs`): a fixed-size worker
//! pool, each running its own `loop { claim; process; sleep_on_empty }`,
//! rather than a single global dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chat_core::ids::{MsgId, UserId};
use chat_core::membership::MembershipProvider;
use chat_core::notify::{PushNotifier, PushTask};
use chat_core::outbox::OutboxRow;
use chat_providers::bus::{Bus, BusEventKind};
use chat_providers::presence::PresenceRegistry;
use chat_providers::retry::BackoffPolicy;
use chat_providers::store::{ClaimedChannelBatch, PgStore};
use chrono::Utc;

pub struct OutboxProcessor {
    store: Arc<PgStore>,
    bus: Arc<dyn Bus>,
    presence: Arc<PresenceRegistry>,
    membership: Arc<dyn MembershipProvider>,
    push: Arc<dyn PushNotifier>,
    backoff: BackoffPolicy,
    batch_size: i64,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<PgStore>,
        bus: Arc<dyn Bus>,
        presence: Arc<PresenceRegistry>,
        membership: Arc<dyn MembershipProvider>,
        push: Arc<dyn PushNotifier>,
        backoff: BackoffPolicy,
        batch_size: i64,
    ) -> Self {
        Self { store, bus, presence, membership, push, backoff, batch_size }
    }

    /// Spawns `worker_count` workers (spec §5: "a small fixed pool, N =
    /// cores * 2"). Each runs until the process shuts down.
    pub fn spawn_workers(self: &Arc<Self>, worker_count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count)
            .map(|idx| {
                let processor = Arc::clone(self);
                tokio::spawn(async move { processor.run(idx).await })
            })
            .collect()
    }

    async fn run(&self, worker_idx: usize) {
        loop {
            let claimed = match self.store.claim_channel_batch(self.batch_size).await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(worker_idx, error = %err, "outbox claim failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            self.process_channel_batch(claimed).await;
        }
    }

    /// Drains one channel's claimed batch in `seqId` order (the rows
    /// already arrive ordered this way from `claim_channel_batch`),
    /// stopping at the first row whose processing fails so later rows in
    /// the same channel are never applied ahead of an earlier one. Rows
    /// past the failure are reverted to `pending` untouched rather than
    /// left stuck `broadcasting`. The channel's advisory lock is released
    /// once this worker is done with the batch either way.
    async fn process_channel_batch(&self, mut claimed: ClaimedChannelBatch) {
        let channel_id = claimed.channel_id;
        let rows = std::mem::take(&mut claimed.rows);
        let mut unclaimed: Vec<MsgId> = Vec::new();
        let mut stopped_early = false;

        for row in rows {
            if stopped_early {
                unclaimed.push(row.msg_id);
                continue;
            }
            if !self.process_row(row).await {
                stopped_early = true;
            }
        }

        if !unclaimed.is_empty() {
            if let Err(err) = self.store.revert_unclaimed_rows(&unclaimed).await {
                tracing::error!(%channel_id, error = %err, "failed to revert unprocessed outbox rows to pending after an earlier row in the channel failed");
            }
        }

        if let Err(err) = self.store.release_channel_lock(claimed).await {
            tracing::error!(%channel_id, error = %err, "failed to release outbox channel advisory lock");
        }
    }

    /// Processes one row; returns `false` only when the row itself failed
    /// and later rows in the same channel batch must not be applied ahead
    /// of it. A failure to record the post-success `done` status is not
    /// ordering-relevant — the unread/push side effects already landed.
    #[tracing::instrument(skip(self, row), fields(msg_id = %row.msg_id, channel_id = %row.channel_id, seq_id = %row.payload.seq_id))]
    async fn process_row(&self, row: OutboxRow) -> bool {
        match self.process_row_inner(&row).await {
            Ok(()) => {
                if let Err(err) = self.store.complete_outbox(row.msg_id, Utc::now()).await {
                    tracing::error!(error = %err, "failed to mark outbox row done after successful processing");
                }
                true
            }
            Err(err) => {
                let next_attempt = row.attempt + 1;
                let failed = self.backoff.exhausted(next_attempt);
                let next_attempt_at = self.backoff.next_attempt_at(next_attempt, Utc::now());
                tracing::warn!(error = %err, attempt = next_attempt, failed, "outbox row processing failed");
                if let Err(err) =
                    self.store.retry_or_fail_outbox(row.msg_id, next_attempt, next_attempt_at, failed).await
                {
                    tracing::error!(error = %err, "failed to record outbox retry/failure state");
                }
                if failed {
                    tracing::error!(msg_id = %row.msg_id, "outbox row exhausted retry budget; manual remediation required");
                }
                false
            }
        }
    }

    async fn process_row_inner(&self, row: &OutboxRow) -> Result<(), chat_providers::error::ProviderError> {
        // Step 2: ensure broadcast happened. Always republishing here is
        // harmless — the Bus makes no uniqueness promise and clients
        // de-dup on `msgId` (spec §4.5 "Why both Bus publish and
        // outbox").
        // Outbox rows only exist for newly-created messages (edit/delete
        // never insert one), so the republish kind is always `Created`.
        self.bus.publish(row.channel_id, BusEventKind::Created, row.payload.clone());

        let members = self
            .membership
            .members(row.channel_id)
            .await
            .map_err(|e| chat_providers::error::ProviderError::External(format!("membership lookup failed: {e}")))?;

        for member in members.into_iter().filter(|m| *m != row.sender_id) {
            self.apply_member_accounting(row, member).await?;
        }

        Ok(())
    }

    async fn apply_member_accounting(
        &self,
        row: &OutboxRow,
        member: UserId,
    ) -> Result<(), chat_providers::error::ProviderError> {
        // SPEC_FULL §12: system messages broadcast but do not bump
        // unread counters.
        if row.payload.kind.counts_toward_unread() {
            self.store
                .apply_unread_increment(member, row.channel_id, row.msg_id, row.payload.seq_id)
                .await?;
        }

        if !self.presence.is_online(member) {
            self.push
                .enqueue(PushTask { user_id: member, channel_id: row.channel_id, msg_id: row.msg_id })
                .await;
        }

        Ok(())
    }
}
