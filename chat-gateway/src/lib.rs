//! Ingest/Sequencer (C5), WebSocket Gateway (C6), Outbox Processor (C7),
//! and Offline/Resync (C8) — the components that depend on the leaf
//! providers in `chat-providers`. Exposed as a library so the `server`
//! binary (`main.rs`) and the integration tests under `tests/` share one
//! wiring surface, the way the donor splits a thin CLI entry point from
//! the library crate underneath it.

pub mod app;
pub mod http;
pub mod ingest;
pub mod outbox_processor;
pub mod rate_limit;
pub mod resync;
pub mod ws;
