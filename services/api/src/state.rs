//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the session store and the examiner.

use crate::{config::Config, db::SessionStore};
use std::sync::Arc;
use viva_core::{examiner::Examiner, source::SourceMaterialService};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub examiner: Arc<dyn Examiner>,
    pub source_service: Arc<dyn SourceMaterialService>,
    pub config: Arc<Config>,
}
