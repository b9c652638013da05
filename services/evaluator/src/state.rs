use std::sync::Arc;

use replay::StageStore;

use crate::connector::Connectors;
use crate::pipeline::PipelineSettings;
use crate::registry::RunRegistry;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub store: Arc<dyn StageStore>,
    pub connectors: Arc<dyn Connectors>,
    pub settings: PipelineSettings,
    pub registry: Arc<RunRegistry>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StageStore>,
        connectors: Arc<dyn Connectors>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry: Arc::new(RunRegistry::new(store.clone())),
            store,
            connectors,
            settings,
        }
    }
}
