//! Shared application state.

use crate::config::Config;
use crate::db::Database;
use std::sync::Arc;

/// State shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Database handle.
    pub db: Database,
}

impl AppState {
    /// Create application state.
    pub fn new(config: Config, db: Database) -> Self {
        Self {
            config: Arc::new(config),
            db,
        }
    }
}
