//! Shared application state, wired explicitly at startup (spec §9
//! "explicit constructor wiring of component interfaces; no global
//! registry" — the redesign's replacement for the source's dynamic
//! service injection/decorators).

use std::sync::Arc;

use chat_core::config::Config;
use chat_core::membership::{AuthProvider, MembershipProvider};
use chat_providers::bus::Bus;
use chat_providers::dedup::DedupCache;
use chat_providers::presence::PresenceRegistry;
use chat_providers::sequence::SequenceService;
use chat_providers::store::PgStore;

use crate::ingest::Ingest;

pub struct GatewayState {
    pub config: Arc<Config>,
    pub gateway_id: String,
    pub store: Arc<PgStore>,
    pub sequence: Arc<SequenceService>,
    pub dedup: Arc<DedupCache>,
    pub bus: Arc<dyn Bus>,
    pub presence: Arc<PresenceRegistry>,
    pub membership: Arc<dyn MembershipProvider>,
    pub auth: Arc<dyn AuthProvider>,
    pub ingest: Arc<Ingest>,
}
