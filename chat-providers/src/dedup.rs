//! Dedup Cache (C1 §4.2 / spec C2): `Check`/`Record` over `clientMsgId`,
//! TTL-expiring. In-process, concurrent, best-effort — the unique
//! constraint on `(channelId, clientMsgId)` is the source of truth (see
//! `store::PgStore::create_message`); this cache only absorbs the common
//! case so most retries never touch the database's conflict path.
//!
//! Grounded on the donor's `Cache` (`ethers-providers/src/cache.rs`): a
//! `DashMap` guarded by a simple struct, except entries expire by TTL
//! instead of living for the process lifetime.

use std::time::{Duration, Instant};

use chat_core::ids::{ChannelId, ClientMsgId, MsgId, SeqId};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct DedupEntry {
    pub msg_id: MsgId,
    pub seq_id: SeqId,
    expires_at: Instant,
}

/// Key is scoped to `(channelId, clientMsgId)` — spec §8 boundary case:
/// the same `clientMsgId` reused across different channels is permitted.
type Key = (ChannelId, ClientMsgId);

#[derive(Default)]
pub struct DedupCache {
    entries: DashMap<Key, DedupEntry>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    /// Best-effort lookup. A miss is not proof of non-existence — the
    /// caller must still fall through to the DB unique check (spec §4.2).
    pub fn check(&self, channel_id: ChannelId, client_msg_id: ClientMsgId) -> Option<DedupEntry> {
        let key = (channel_id, client_msg_id);
        match self.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(*entry),
            Some(_) => {
                drop(self.entries.remove(&key));
                None
            }
            None => None,
        }
    }

    pub fn record(&self, channel_id: ChannelId, client_msg_id: ClientMsgId, msg_id: MsgId, seq_id: SeqId) {
        let key = (channel_id, client_msg_id);
        self.entries.insert(key, DedupEntry { msg_id, seq_id, expires_at: Instant::now() + self.ttl });
    }

    /// Sweeps expired entries. Intended to run on a periodic background
    /// task; `check`'s lazy eviction keeps correctness even if the sweep
    /// falls behind.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_check_hits() {
        let cache = DedupCache::new(Duration::from_secs(300));
        let channel = ChannelId::new_v4();
        let client_msg_id = ClientMsgId::new_v4();
        let msg_id = MsgId::generate();

        assert!(cache.check(channel, client_msg_id).is_none());
        cache.record(channel, client_msg_id, msg_id, SeqId(7));

        let hit = cache.check(channel, client_msg_id).unwrap();
        assert_eq!(hit.msg_id, msg_id);
        assert_eq!(hit.seq_id, SeqId(7));
    }

    #[test]
    fn same_client_msg_id_scoped_per_channel() {
        let cache = DedupCache::new(Duration::from_secs(300));
        let client_msg_id = ClientMsgId::new_v4();
        let channel_a = ChannelId::new_v4();
        let channel_b = ChannelId::new_v4();

        cache.record(channel_a, client_msg_id, MsgId::generate(), SeqId(1));
        assert!(cache.check(channel_b, client_msg_id).is_none());
    }

    #[test]
    fn expired_entries_are_evicted_lazily_and_by_sweep() {
        let cache = DedupCache::new(Duration::from_millis(1));
        let channel = ChannelId::new_v4();
        let client_msg_id = ClientMsgId::new_v4();
        cache.record(channel, client_msg_id, MsgId::generate(), SeqId(1));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.check(channel, client_msg_id).is_none());
        assert!(cache.is_empty());
    }
}
