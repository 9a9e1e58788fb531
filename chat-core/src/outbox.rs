//! The `OutboxRow` entity (spec §3, §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, MsgId, TenantId, UserId};
use crate::message::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Broadcasting,
    Delivered,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub msg_id: MsgId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub tenant_id: TenantId,
    pub payload: Envelope,
    pub status: OutboxStatus,
    pub attempt: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, OutboxStatus::Done | OutboxStatus::Failed)
    }
}
