//! services/client/src/runner/state.rs
//!
//! Defines the client's shared state.

use crate::config::Config;
use page_forge_core::{ports::GenerationTransport, SessionCache};
use std::sync::Arc;

/// The shared application state, created once at startup and handed to the runner.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub transport: Arc<dyn GenerationTransport>,
    pub cache: SessionCache,
}
