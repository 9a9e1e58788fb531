//! Leaf components (spec §2: C1-C4, leaves) plus the SQL-backed store
//! C5/C7/C8 share. Each module here is independently testable and has no
//! knowledge of the WebSocket/HTTP surface, the same separation the donor
//! keeps between `ethers-providers`'s transports/cache/pubsub and the
//! request-routing `Provider` that sits above them.

pub mod bus;
pub mod dedup;
pub mod error;
pub mod presence;
pub mod retry;
pub mod sequence;
pub mod store;

pub use bus::{Bus, InProcessBus};
pub use dedup::DedupCache;
pub use error::ProviderError;
pub use presence::PresenceRegistry;
pub use retry::BackoffPolicy;
pub use sequence::{SequenceMode, SequenceService};
pub use store::PgStore;
