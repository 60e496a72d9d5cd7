//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every handler needs.

use crate::config::Config;
use std::sync::Arc;
use voxline_core::lifecycle::LifecycleController;
use voxline_core::provisioner::catalog::ModelCatalog;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: LifecycleController,
    /// Catalogs checked by the health endpoint.
    pub ollama: Arc<dyn ModelCatalog>,
    pub speaches: Arc<dyn ModelCatalog>,
    pub config: Arc<Config>,
}
