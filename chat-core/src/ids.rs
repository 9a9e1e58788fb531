//! Newtype identifiers.
//!
//! Keeping `channelId`/`userId`/`msgId` as distinct types (rather than bare
//! `Uuid`) makes it a compile error to pass a `UserId` where a `ChannelId` is
//! expected, which matters a lot in a codebase with this many UUID-shaped
//! fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(ChannelId);
uuid_id!(UserId);
uuid_id!(TenantId);
uuid_id!(ClientMsgId);

/// Server-assigned, time-sortable message id (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(pub Uuid);

impl MsgId {
    /// Generates a new time-sortable id. See spec §3: `msgId` must be
    /// UUIDv7, server-assigned, globally unique.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for MsgId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// Per-channel monotonic sequence number. Signed so Postgres `bigint`
/// round-trips without a cast; see §8 for the overflow note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqId(pub i64);

impl SeqId {
    /// The maximum representable sequence id. At one message per
    /// microsecond this is centuries of runway; documented per §8's
    /// "sequence overflow" boundary case.
    pub const MAX: SeqId = SeqId(i64::MAX);

    pub fn next(self) -> Self {
        SeqId(self.0 + 1)
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_ids_are_time_sortable() {
        let a = MsgId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = MsgId::generate();
        assert!(a.as_uuid().as_bytes() < b.as_uuid().as_bytes());
    }

    #[test]
    fn seq_id_display_and_next() {
        let s = SeqId(41);
        assert_eq!(s.next(), SeqId(42));
        assert_eq!(s.to_string(), "41");
    }
}
