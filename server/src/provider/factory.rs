//! Provider factory
//!
//! One provider instance per (backend, logical name). Instances are built
//! lazily from the server configuration and live until [`ProviderFactory::shutdown`].

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info};

use super::cluster::{ClusterLeases, ClusterProvider, ClusterProviderConfig, ClusterSource};
use super::container::{ContainerProvider, ContainerProviderConfig};
use super::EnvironmentProvider;
use crate::config::Config;
use crate::domain::environment::BackendType;
use crate::error::{Error, Result};
use crate::infra::docker::ContainerEngine;
use crate::infra::process::ProcessRunner;

/// Logical name used when a request does not name a provider
pub const DEFAULT_PROVIDER: &str = "default";

type ProviderKey = (BackendType, String);

pub struct ProviderFactory {
    config: Arc<Config>,
    runner: Arc<dyn ProcessRunner>,
    engine: Option<Arc<dyn ContainerEngine>>,
    clusters: Option<Arc<dyn ClusterSource>>,
    leases: Arc<ClusterLeases>,
    providers: DashMap<ProviderKey, Arc<dyn EnvironmentProvider>>,
}

impl ProviderFactory {
    pub fn new(
        config: Arc<Config>,
        runner: Arc<dyn ProcessRunner>,
        engine: Option<Arc<dyn ContainerEngine>>,
        clusters: Option<Arc<dyn ClusterSource>>,
        leases: Arc<ClusterLeases>,
    ) -> Self {
        Self {
            config,
            runner,
            engine,
            clusters,
            leases,
            providers: DashMap::new(),
        }
    }

    /// The singleton provider for `(backend, name)`, built on first use
    pub fn get(&self, backend: BackendType, name: &str) -> Result<Arc<dyn EnvironmentProvider>> {
        let key = (backend, name.to_string());
        if let Some(provider) = self.providers.get(&key) {
            return Ok(provider.clone());
        }

        let built = self.build(backend, name)?;
        // A concurrent caller may have won the race; keep whichever landed first
        let provider = self.providers.entry(key).or_insert(built).clone();
        Ok(provider)
    }

    /// Register a pre-built provider under `(backend, name)`
    pub fn register(&self, name: &str, provider: Arc<dyn EnvironmentProvider>) {
        self.providers
            .insert((provider.backend(), name.to_string()), provider);
    }

    pub fn providers(&self) -> Vec<Arc<dyn EnvironmentProvider>> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    fn build(&self, backend: BackendType, name: &str) -> Result<Arc<dyn EnvironmentProvider>> {
        info!("Creating {} provider '{}'", backend, name);
        let provider: Arc<dyn EnvironmentProvider> = match backend {
            BackendType::Cluster => Arc::new(ClusterProvider::new(
                name,
                ClusterProviderConfig::from_config(&self.config),
                self.runner.clone(),
                self.clusters.clone(),
                self.leases.clone(),
            )),
            BackendType::Container => {
                let engine = self.engine.clone().ok_or_else(|| {
                    Error::DockerError("Container engine is not available".to_string())
                })?;
                Arc::new(ContainerProvider::new(
                    name,
                    ContainerProviderConfig::from_config(&self.config),
                    engine,
                    self.runner.clone(),
                ))
            }
        };
        Ok(provider)
    }

    /// Destroy every environment still tracked by any provider
    ///
    /// Returns the number of environments destroyed.
    pub async fn shutdown(&self) -> usize {
        let mut destroyed = 0;
        for provider in self.providers() {
            for id in provider.environment_ids() {
                match provider.destroy_environment(&id).await {
                    Ok(()) => destroyed += 1,
                    Err(e) => error!(
                        "Failed to destroy environment {} on {} provider '{}': {}",
                        id,
                        provider.backend(),
                        provider.name(),
                        e
                    ),
                }
            }
        }
        self.providers.clear();
        info!("Provider factory shut down, {} environment(s) destroyed", destroyed);
        destroyed
    }
}
