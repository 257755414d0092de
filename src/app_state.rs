use std::sync::Arc;

use crate::services::{queue::JobStore, rate_limit::RateLimiters};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub limiters: Arc<RateLimiters>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, limiters: RateLimiters) -> Self {
        Self {
            store,
            limiters: Arc::new(limiters),
        }
    }
}
