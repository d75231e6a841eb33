use std::sync::Arc;

use crate::services::{ingestion::IngestionService, queue::JobQueue, storage::ArtifactStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ArtifactStore>,
    pub queue: Arc<dyn JobQueue>,
    pub ingestion: Arc<IngestionService>,
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        queue: Arc<dyn JobQueue>,
        ingestion: IngestionService,
        api_key: Option<String>,
    ) -> Self {
        Self {
            store,
            queue,
            ingestion: Arc::new(ingestion),
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }
}
