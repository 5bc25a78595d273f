//! services/api/src/web/state.rs
//!
//! Defines the application state shared by every handler.

use crate::adapters::StatusEvent;
use crate::config::Config;
use cv_pipeline_core::{DocumentStore, Orchestrator, ProcessingQueue};
use std::sync::Arc;
use tokio::sync::broadcast;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// The same store the orchestrator writes through, for reads.
    pub store: Arc<dyn DocumentStore>,
    pub queue: ProcessingQueue,
    /// Status snapshots published by the notifying store.
    pub events: broadcast::Sender<StatusEvent>,
    pub config: Arc<Config>,
}
