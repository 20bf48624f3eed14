//! Shared application state for the token server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds the resolved configuration and the
//! composed core subsystems: token lifecycle, secrets, and activity
//! accounting.

use std::sync::Arc;

use tokend_core::{Database, SecretsStore, TokenManager};

use crate::activity::ActivityRecorder;
use crate::config::ServerConfig;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub db: Arc<Database>,
    pub token_manager: TokenManager,
    pub secrets_store: Arc<SecretsStore>,
    pub activity: Arc<ActivityRecorder>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
