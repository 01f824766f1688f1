use std::sync::Arc;

use cro_domain::config::Config;
use cro_orchestrator::SessionHub;

/// Shared application state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<SessionHub>,
}
