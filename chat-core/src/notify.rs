//! Offline push notification interface (spec §1: "notifications UX" is an
//! external collaborator; §4.7 step 3: "enqueue a push task (external
//! notifier)"). The core only ever enqueues; rendering, device tokens,
//! and delivery belong to a notifications service this crate does not
//! own.

use async_trait::async_trait;

use crate::ids::{ChannelId, MsgId, UserId};

#[derive(Debug, Clone)]
pub struct PushTask {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub msg_id: MsgId,
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn enqueue(&self, task: PushTask);
}

/// Dev/test stand-in that logs instead of calling out to a real push
/// provider.
#[derive(Default)]
pub struct LoggingPush;

#[async_trait]
impl PushNotifier for LoggingPush {
    async fn enqueue(&self, task: PushTask) {
        tracing::debug!(
            user_id = %task.user_id,
            channel_id = %task.channel_id,
            msg_id = %task.msg_id,
            "push task enqueued (no-op notifier)"
        );
    }
}
