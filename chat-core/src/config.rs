//! Environment-driven configuration (spec §6 "Config"), in the donor's
//! `clap::Parser` + `env =` style (see the state-relay-server binary).

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket gateway listens on.
    #[clap(long, env = "CHAT_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Postgres connection string backing messages/outbox/seq/unread.
    #[clap(long, env = "CHAT_DATABASE_URL", default_value = "postgres://localhost/chat")]
    pub database_url: String,

    /// This gateway instance's identifier, used as the Presence key.
    #[clap(long, env = "CHAT_GATEWAY_ID")]
    pub gateway_id: Option<String>,

    /// Heartbeat interval clients must ping within (T_heartbeat, spec §5).
    #[clap(long, env = "CHAT_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Number of missed heartbeats tolerated before `session_timeout`.
    #[clap(long, env = "CHAT_HEARTBEAT_MISSES", default_value_t = 2)]
    pub heartbeat_misses: u32,

    /// Fixed-size outbox worker pool (spec §5: N = cores * 2 by default).
    #[clap(long, env = "CHAT_OUTBOX_WORKERS", default_value_t = 0)]
    pub outbox_workers: usize,

    /// Outbox rows claimed per worker poll.
    #[clap(long, env = "CHAT_OUTBOX_BATCH_SIZE", default_value_t = 64)]
    pub outbox_batch_size: i64,

    /// Max retry attempts before an outbox row is marked `failed`.
    #[clap(long, env = "CHAT_OUTBOX_MAX_ATTEMPTS", default_value_t = 10)]
    pub outbox_max_attempts: i32,

    /// Base backoff for outbox retries, doubled per attempt up to a cap.
    #[clap(long, env = "CHAT_OUTBOX_BACKOFF_BASE_SECS", default_value_t = 1)]
    pub outbox_backoff_base_secs: u64,

    #[clap(long, env = "CHAT_OUTBOX_BACKOFF_CAP_SECS", default_value_t = 300)]
    pub outbox_backoff_cap_secs: u64,

    /// Bounded per-connection outbound buffer (spec §5 "drop-and-reconnect
    /// on overflow").
    #[clap(long, env = "CHAT_MAX_OUTBOUND_BUFFER", default_value_t = 256)]
    pub max_outbound_buffer: usize,

    /// TTL for dedup cache entries (spec §3: "TTL >= 5 minutes").
    #[clap(long, env = "CHAT_DEDUP_TTL_SECS", default_value_t = 300)]
    pub dedup_ttl_secs: u64,

    /// Default page size for Resync.
    #[clap(long, env = "CHAT_RESYNC_PAGE_SIZE", default_value_t = 200)]
    pub resync_page_size: i64,

    /// Ingest wall-clock budget (spec §5).
    #[clap(long, env = "CHAT_INGEST_TIMEOUT_SECS", default_value_t = 5)]
    pub ingest_timeout_secs: u64,

    /// Whether a new connection kicks an existing one for the same account
    /// (spec §4.6 "Kick semantics" / SPEC_FULL §12 open-question decision).
    #[clap(long, env = "CHAT_SINGLE_SESSION", default_value_t = false)]
    pub single_session: bool,

    /// Per-sender token-bucket rate: messages per second.
    #[clap(long, env = "CHAT_RATE_LIMIT_PER_SEC", default_value_t = 20)]
    pub rate_limit_per_sec: u32,

    /// Per-sender token-bucket burst size.
    #[clap(long, env = "CHAT_RATE_LIMIT_BURST", default_value_t = 40)]
    pub rate_limit_burst: u32,
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    /// Resolves the outbox worker pool size, defaulting to `cores * 2`
    /// (spec §5) when left at 0.
    pub fn resolved_outbox_workers(&self) -> usize {
        if self.outbox_workers == 0 {
            std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(4)
        } else {
            self.outbox_workers
        }
    }

    /// Initializes the global `tracing` subscriber from `RUST_LOG`.
    pub fn init_tracing(&self) {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_workers_default_to_cores_times_two_when_unset() {
        let mut cfg = Config::parse_from(["test"]);
        cfg.outbox_workers = 0;
        assert!(cfg.resolved_outbox_workers() >= 2);
    }
}
