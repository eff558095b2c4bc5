//! Shared state for the HTTP surface

use crate::config::Config;
use crate::listeners::http::HttpBinding;
use crate::pipeline::{Intake, Orchestrator};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub intake: Intake,
    pub orchestrator: Arc<Orchestrator>,
    /// Ingestion paths and the routes they feed
    pub http_bindings: Arc<HashMap<String, HttpBinding>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, intake: Intake, orchestrator: Arc<Orchestrator>) -> Self {
        let http_bindings = HttpBinding::from_routes(&config.routes);
        Self {
            config,
            intake,
            orchestrator,
            http_bindings: Arc::new(http_bindings),
        }
    }
}
