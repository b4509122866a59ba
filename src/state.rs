use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::syncer::TagSyncer;
use std::sync::Arc;

/// Shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub(crate) tag_syncer: Arc<TagSyncer>,
    pub(crate) notifier: Notifier,
    pub(crate) metrics: Metrics,
}

impl AppState {
    pub fn new(tag_syncer: Arc<TagSyncer>, notifier: Notifier, metrics: Metrics) -> Self {
        Self {
            tag_syncer,
            notifier,
            metrics,
        }
    }
}
