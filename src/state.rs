use crate::services::event_service::EventService;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub events: EventService,
    /// Token MinIO must present on webhook deliveries, if configured.
    pub auth_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(events: EventService, auth_token: Option<String>) -> Self {
        Self {
            events,
            auth_token: auth_token.map(Arc::from),
        }
    }
}
