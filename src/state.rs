//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::DiffSettings;
use crate::coordinator::DiffCoordinator;
use crate::store::MetadataStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Snapshot and diff persistence (memory or PostgreSQL)
    pub store: Arc<dyn MetadataStore>,

    /// Diff run coordinator (holds the per-connection run locks)
    pub coordinator: DiffCoordinator,
}

impl AppState {
    pub fn new(store: Arc<dyn MetadataStore>, diff: DiffSettings) -> Self {
        Self {
            coordinator: DiffCoordinator::new(store.clone(), diff),
            store,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
