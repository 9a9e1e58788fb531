//! Presence Registry (spec §4.3): `Bind`/`Unbind`/`Lookup`, sharded by
//! `userId` via `DashMap`'s own internal sharding — the same concurrent
//! hash map approach the donor uses for its subscription/channel maps
//! (`SharedChannelMap` in `rpc/transports/ws/manager.rs`), just keyed
//! differently.

use std::time::Instant;

use chat_core::ids::UserId;
use dashmap::DashMap;
use tokio::sync::broadcast;

pub type GatewayId = String;
pub type ConnId = uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Binding {
    last_ping: Instant,
}

/// Who is online, and which gateway instance(s) hold their connection(s).
/// A user is online iff their binding set is non-empty.
#[derive(Default)]
pub struct PresenceRegistry {
    // userId -> (gatewayId, connId) -> last ping
    bindings: DashMap<UserId, DashMap<(GatewayId, ConnId), Binding>>,
    // userId -> broadcast of newly-bound connIds, used for single-session
    // kick enforcement (spec §4.6 "Kick semantics"): every connection for
    // a user subscribes here and closes itself if it sees a connId that
    // isn't its own.
    kick_signals: DashMap<UserId, broadcast::Sender<ConnId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, user: UserId, gateway: GatewayId, conn: ConnId) {
        let shard = self.bindings.entry(user).or_default();
        shard.insert((gateway, conn), Binding { last_ping: Instant::now() });
    }

    /// A user becomes offline only when their binding set becomes empty
    /// (spec §4.3).
    pub fn unbind(&self, user: UserId, gateway: GatewayId, conn: ConnId) {
        if let Some(shard) = self.bindings.get(&user) {
            shard.remove(&(gateway, conn));
            let now_empty = shard.is_empty();
            drop(shard);
            if now_empty {
                self.bindings.remove(&user);
            }
        }
    }

    pub fn heartbeat(&self, user: UserId, gateway: GatewayId, conn: ConnId) {
        if let Some(shard) = self.bindings.get(&user) {
            if let Some(mut binding) = shard.get_mut(&(gateway, conn)) {
                binding.last_ping = Instant::now();
            }
        }
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.bindings.get(&user).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn lookup(&self, user: UserId) -> Vec<GatewayId> {
        self.bindings
            .get(&user)
            .map(|shard| shard.iter().map(|e| e.key().0.clone()).collect())
            .unwrap_or_default()
    }

    /// Filters `users` down to those currently online. Used by the Outbox
    /// Processor to decide who needs an offline push (spec §4.7).
    pub fn filter_online(&self, users: &[UserId]) -> Vec<UserId> {
        users.iter().copied().filter(|u| self.is_online(*u)).collect()
    }

    pub fn filter_offline(&self, users: &[UserId]) -> Vec<UserId> {
        users.iter().copied().filter(|u| !self.is_online(*u)).collect()
    }

    /// Subscribes to single-session kick notifications for `user` (spec
    /// §4.6). The returned receiver yields the `connId` of every new
    /// connection bound for this user going forward; a receiver closes
    /// itself when it sees a `connId` other than its own.
    pub fn subscribe_kicks(&self, user: UserId) -> broadcast::Receiver<ConnId> {
        self.kick_signals.entry(user).or_insert_with(|| broadcast::channel(8).0).subscribe()
    }

    /// Announces that `conn` has just bound for `user`, so any other live
    /// connection for that user enforces single-session closure.
    pub fn announce_new_connection(&self, user: UserId, conn: ConnId) {
        if let Some(tx) = self.kick_signals.get(&user) {
            let _ = tx.send(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_unbind_toggles_online() {
        let presence = PresenceRegistry::new();
        let user = UserId::new_v4();
        let conn = ConnId::new_v4();
        assert!(!presence.is_online(user));

        presence.bind(user, "gw-1".into(), conn);
        assert!(presence.is_online(user));

        presence.unbind(user, "gw-1".into(), conn);
        assert!(!presence.is_online(user));
    }

    #[test]
    fn multiple_connections_keep_user_online_until_all_unbind() {
        let presence = PresenceRegistry::new();
        let user = UserId::new_v4();
        let conn_a = ConnId::new_v4();
        let conn_b = ConnId::new_v4();

        presence.bind(user, "gw-1".into(), conn_a);
        presence.bind(user, "gw-2".into(), conn_b);
        assert_eq!(presence.lookup(user).len(), 2);

        presence.unbind(user, "gw-1".into(), conn_a);
        assert!(presence.is_online(user));

        presence.unbind(user, "gw-2".into(), conn_b);
        assert!(!presence.is_online(user));
    }

    #[tokio::test]
    async fn kick_signal_notifies_other_subscribers_of_new_connection() {
        let presence = PresenceRegistry::new();
        let user = UserId::new_v4();
        let mut old_conn_kicks = presence.subscribe_kicks(user);

        let new_conn = ConnId::new_v4();
        presence.announce_new_connection(user, new_conn);

        assert_eq!(old_conn_kicks.recv().await.unwrap(), new_conn);
    }

    #[test]
    fn filter_online_and_offline_partition_correctly() {
        let presence = PresenceRegistry::new();
        let online_user = UserId::new_v4();
        let offline_user = UserId::new_v4();
        presence.bind(online_user, "gw-1".into(), ConnId::new_v4());

        let users = [online_user, offline_user];
        assert_eq!(presence.filter_online(&users), vec![online_user]);
        assert_eq!(presence.filter_offline(&users), vec![offline_user]);
    }
}
