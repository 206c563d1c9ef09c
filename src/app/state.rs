//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::{BoundedIntent, SessionDirectory};
use crate::util::rate_limit::{create_limiter, Limiter, LOBBY_RATE_LIMIT};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<SessionDirectory>,
    /// Throttles session create/join/start requests
    pub lobby_limiter: Arc<Limiter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let directory = if config.strict_intents {
            SessionDirectory::with_policy(config.game.clone(), Arc::new(BoundedIntent))
        } else {
            SessionDirectory::new(config.game.clone())
        };
        Self::with_directory(config, Arc::new(directory))
    }

    /// State around an existing directory (custom policy or settings)
    pub fn with_directory(config: Config, directory: Arc<SessionDirectory>) -> Self {
        Self {
            config: Arc::new(config),
            directory,
            lobby_limiter: create_limiter(LOBBY_RATE_LIMIT),
        }
    }
}
