//! `chat-gateway` binary: wires the leaf providers (chat-providers) and
//! the core vocabulary (chat-core) into one running process exposing the
//! `/ws/v1` WebSocket upgrade and the HTTP surface of spec §6, then
//! spawns the Outbox Processor worker pool (C7) alongside it.
//!
//! Explicit constructor wiring, no global registry (spec §9) — everything
//! built here is handed to `axum::Router::with_state` once.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use chat_core::config::Config;
use chat_core::membership::{StaticAuth, StaticMembership};
use chat_core::notify::LoggingPush;
use chat_gateway::app::GatewayState;
use chat_gateway::ingest::Ingest;
use chat_gateway::outbox_processor::OutboxProcessor;
use chat_gateway::rate_limit::RateLimiter;
use chat_gateway::{http, ws};
use chat_providers::bus::InProcessBus;
use chat_providers::dedup::DedupCache;
use chat_providers::presence::PresenceRegistry;
use chat_providers::retry::BackoffPolicy;
use chat_providers::sequence::SequenceService;
use chat_providers::store::PgStore;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.init_tracing();

    let pool = PgPoolOptions::new().max_connections(20).connect(&config.database_url).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    store.run_migrations().await?;

    let sequence = Arc::new(SequenceService::new(pool.clone()));
    let dedup = Arc::new(DedupCache::new(config.dedup_ttl()));
    let bus: Arc<dyn chat_providers::bus::Bus> = Arc::new(InProcessBus::new(1024));
    let presence = Arc::new(PresenceRegistry::new());

    // Out-of-scope collaborators (spec §1): auth and channel membership
    // are owned by services this core does not implement. The static
    // stand-ins below are a local/dev convenience; a real deployment
    // swaps them for clients of the real services without touching the
    // rest of this wiring.
    let auth: Arc<dyn chat_core::membership::AuthProvider> = Arc::new(StaticAuth::default());
    let membership: Arc<dyn chat_core::membership::MembershipProvider> = Arc::new(StaticMembership::default());
    let push: Arc<dyn chat_core::notify::PushNotifier> = Arc::new(LoggingPush);

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst));

    let ingest = Arc::new(Ingest::new(
        Arc::clone(&store),
        Arc::clone(&sequence),
        Arc::clone(&dedup),
        Arc::clone(&bus),
        Arc::clone(&membership),
        Arc::clone(&rate_limiter),
        config.ingest_timeout(),
    ));

    let gateway_id = config.gateway_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let config = Arc::new(config);

    let state = Arc::new(GatewayState {
        config: Arc::clone(&config),
        gateway_id,
        store: Arc::clone(&store),
        sequence,
        dedup: Arc::clone(&dedup),
        bus: Arc::clone(&bus),
        presence: Arc::clone(&presence),
        membership: Arc::clone(&membership),
        auth,
        ingest,
    });

    let backoff = BackoffPolicy::new(
        Duration::from_secs(config.outbox_backoff_base_secs),
        Duration::from_secs(config.outbox_backoff_cap_secs),
        config.outbox_max_attempts,
    );
    let outbox_processor = Arc::new(OutboxProcessor::new(
        store,
        bus,
        presence,
        membership,
        push,
        backoff,
        config.outbox_batch_size,
    ));
    let _outbox_workers = outbox_processor.spawn_workers(config.resolved_outbox_workers());

    tokio::spawn(dedup_sweep_loop(dedup, config.dedup_ttl()));

    let router = Router::new()
        .route("/ws/v1", get(ws::upgrade))
        .route("/v1/channels/:channel_id/messages", post(http::create_message).get(http::list_messages))
        .route("/v1/messages/:msg_id", post(http::edit_message).delete(http::delete_message))
        .route("/v1/channels/:channel_id/read", post(http::mark_read))
        .route("/v1/channels/:channel_id/unread", get(http::unread_count))
        .route("/healthz", get(http::healthz))
        .route("/readyz", get(http::readyz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "chat-gateway listening");
    axum::serve(listener, router).await?;

    Ok(())
}

/// Periodically evicts expired dedup entries (spec §3: TTL-expiring
/// `DedupEntry`). `DedupCache::check` also evicts lazily, so this loop is
/// a housekeeping sweep rather than a correctness requirement.
async fn dedup_sweep_loop(dedup: Arc<DedupCache>, ttl: Duration) {
    let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(1)));
    loop {
        interval.tick().await;
        let swept = dedup.sweep_expired();
        if swept > 0 {
            tracing::debug!(swept, "dedup cache sweep");
        }
    }
}
