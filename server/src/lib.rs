//! Workshop sandbox orchestration
//!
//! Provisions short-lived sandboxes on a virtual-cluster or container
//! backend, drives workshop sessions through their steps and keeps a
//! registry of the parent clusters backing them.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod provider;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};

use provider::ProviderFactory;
use service::registry::ClusterRegistry;
use service::session::SessionOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub registry: Arc<ClusterRegistry>,
    pub factory: Arc<ProviderFactory>,
}
