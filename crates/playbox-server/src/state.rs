//! Application state

use std::sync::Arc;

use playbox_sandbox::ContainerPool;

use crate::api::health::CachedHealth;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ContainerPool>,
    pub health: Arc<CachedHealth>,
}

impl AppState {
    pub fn new(pool: Arc<ContainerPool>) -> Self {
        Self {
            pool,
            health: Arc::new(CachedHealth::default()),
        }
    }
}
