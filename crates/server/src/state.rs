use std::sync::Arc;

use elara_events::LiveBus;

use crate::config::ServerConfig;
use crate::service::Orchestrator;

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: Arc<LiveBus>,
    pub config: Arc<ServerConfig>,
}
