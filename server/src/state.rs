use std::sync::Arc;

use crate::hub::RealtimeHub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// The realtime service: connections, rooms, fan-out
    pub hub: Arc<RealtimeHub>,
}
