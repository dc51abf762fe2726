//! Cluster registry
//!
//! Catalog of parent clusters backing the cluster provider. Keeps the
//! single-default invariant on every mutation, probes connectivity and
//! aggregates capacity for metrics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::cluster::{
    ClusterCapacity, ClusterMetrics, ClusterRecord, ClusterStatus, ClusterUsage,
    CreateClusterParams, UpdateClusterParams,
};
use crate::domain::quantity::{parse_bytes, parse_cpu_millis};
use crate::error::{Error, Result};
use crate::infra::kubectl::{self, Kubectl};
use crate::infra::process::{run_checked, ProcessRunner};
use crate::infra::store::Store;
use crate::provider::cluster::{ClusterLeases, ClusterSource};

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ClusterRegistry {
    store: Arc<dyn Store>,
    runner: Arc<dyn ProcessRunner>,
    leases: Arc<ClusterLeases>,
    kubectl_bin: String,
    scratch_dir: String,
    /// Serializes record writes; never held while probing a cluster
    write_lock: Mutex<()>,
}

impl ClusterRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<dyn ProcessRunner>,
        leases: Arc<ClusterLeases>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            runner,
            leases,
            kubectl_bin: config.kubectl_bin.clone(),
            scratch_dir: config.kubeconfig_dir.clone(),
            write_lock: Mutex::new(()),
        }
    }

    /// Register a cluster and probe it once
    pub async fn add_cluster(&self, params: CreateClusterParams) -> Result<ClusterRecord> {
        if params.name.trim().is_empty() || params.endpoint.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "cluster name and endpoint are required".to_string(),
            ));
        }

        let record = ClusterRecord::new(Uuid::new_v4().to_string(), params);
        {
            let _guard = self.write_lock.lock().await;
            let demoted = if record.is_default {
                self.demote_defaults(&record.id).await?
            } else {
                Vec::new()
            };
            if let Err(e) = self.store.create_cluster_record(&record).await {
                self.restore_defaults(demoted).await;
                return Err(e);
            }
            self.ensure_single_default().await?;
        }
        info!("Registered cluster {} ({})", record.name, record.id);

        self.test_connection(&record.id).await
    }

    pub async fn update_cluster(
        &self,
        id: &str,
        params: UpdateClusterParams,
    ) -> Result<ClusterRecord> {
        let reconnect = params.endpoint.is_some() || params.credential.is_some();
        let record = {
            let _guard = self.write_lock.lock().await;
            let mut record = self.store.get_cluster_record(id).await?;
            let demoted = if params.is_default == Some(true) {
                self.demote_defaults(id).await?
            } else {
                Vec::new()
            };
            record.apply(params);
            if let Err(e) = self.store.update_cluster_record(&record).await {
                self.restore_defaults(demoted).await;
                return Err(e);
            }
            self.ensure_single_default().await?;
            record
        };
        info!("Updated cluster {} ({})", record.name, record.id);

        if reconnect {
            return self.test_connection(id).await;
        }
        Ok(record)
    }

    /// Refused while any sandbox is placed on the cluster
    pub async fn remove_cluster(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let record = self.store.get_cluster_record(id).await?;

        let active = self.leases.count(id);
        if active > 0 {
            return Err(Error::InUse {
                cluster_id: id.to_string(),
                active,
            });
        }

        self.store.delete_cluster_record(id).await?;
        for scratch in kubectl::cluster_scratch_files(&self.scratch_dir, id) {
            if let Err(e) = kubectl::remove_kubeconfig(&scratch).await {
                warn!("Failed to remove credentials of cluster {}: {}", id, e);
            }
        }
        info!("Removed cluster {} ({})", record.name, id);
        Ok(())
    }

    pub async fn get_cluster(&self, id: &str) -> Result<ClusterRecord> {
        self.store.get_cluster_record(id).await
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        self.store.get_cluster_records().await
    }

    /// Probe the cluster and record the outcome
    ///
    /// An unreachable cluster is not an error: the record comes back with
    /// status `error` and the reason in `status_message`. A connected cluster
    /// stays `connected` while it is re-checked so placements keep using it.
    pub async fn test_connection(&self, id: &str) -> Result<ClusterRecord> {
        let record = self
            .write_status(id, |record| {
                if record.status != ClusterStatus::Connected {
                    record.status = ClusterStatus::Testing;
                }
            })
            .await?;

        let outcome = self.probe(&record).await;

        self.write_status(id, |record| {
            record.last_health_check = Some(Utc::now());
            match outcome {
                Ok(capacity) => {
                    record.status = ClusterStatus::Connected;
                    record.status_message = None;
                    record.capacity = capacity;
                }
                Err(e) => {
                    warn!("Cluster {} failed its connection test: {}", record.id, e);
                    record.status = ClusterStatus::Error;
                    record.status_message = Some(e.to_string());
                }
            }
        })
        .await
    }

    /// Re-read, mutate and store a record under the write lock
    async fn write_status<F>(&self, id: &str, f: F) -> Result<ClusterRecord>
    where
        F: FnOnce(&mut ClusterRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.store.get_cluster_record(id).await?;
        f(&mut record);
        record.updated_at = Utc::now();
        self.store.update_cluster_record(&record).await?;
        Ok(record)
    }

    async fn probe(&self, record: &ClusterRecord) -> Result<ClusterCapacity> {
        let access = kubectl::access_for_cluster(record, &self.scratch_dir).await?;
        let kubectl = Kubectl::new(&self.kubectl_bin, access);

        let version = run_checked(
            self.runner.as_ref(),
            kubectl
                .invocation(["version", "-o", "json"])
                .timeout(PROBE_TIMEOUT),
        )
        .await?;
        let version = kubectl::parse_json(&version.stdout)?
            .pointer("/serverVersion/gitVersion")
            .and_then(Value::as_str)
            .map(str::to_string);

        let nodes = run_checked(
            self.runner.as_ref(),
            kubectl
                .invocation(["get", "nodes", "-o", "json"])
                .timeout(PROBE_TIMEOUT),
        )
        .await?;
        let nodes = kubectl::parse_json(&nodes.stdout)?;

        Ok(capacity_from_nodes(version, kubectl::items(&nodes)))
    }

    /// Probe every registered cluster; failures only affect that cluster's status
    pub async fn health_check_all(&self) -> usize {
        let records = match self.store.get_cluster_records().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to list clusters for health check: {}", e);
                return 0;
            }
        };

        let mut connected = 0;
        for record in records {
            match self.test_connection(&record.id).await {
                Ok(updated) if updated.is_available() => connected += 1,
                Ok(_) => {}
                Err(e) => warn!("Health check of cluster {} failed: {}", record.id, e),
            }
        }
        connected
    }

    pub async fn get_metrics(&self) -> Result<ClusterMetrics> {
        let records = self.store.get_cluster_records().await?;
        let counts = self.leases.counts();

        let mut metrics = ClusterMetrics {
            total_clusters: records.len(),
            ..Default::default()
        };
        for record in records {
            match record.status {
                ClusterStatus::Connected => metrics.connected += 1,
                ClusterStatus::Error => metrics.errored += 1,
                ClusterStatus::Disconnected | ClusterStatus::Testing => metrics.disconnected += 1,
            }
            let active = counts.get(&record.id).copied().unwrap_or(0);
            metrics.total_nodes += record.capacity.node_count;
            metrics.total_cpu_millis += record.capacity.cpu_millis;
            metrics.total_memory_bytes += record.capacity.memory_bytes;
            metrics.active_environments += active;
            metrics.clusters.push(ClusterUsage {
                cluster_id: record.id,
                name: record.name,
                status: record.status,
                active_environments: active,
                capacity: record.capacity,
            });
        }
        Ok(metrics)
    }

    /// Clear the default flag everywhere but `keep`; returns the demoted records
    async fn demote_defaults(&self, keep: &str) -> Result<Vec<ClusterRecord>> {
        let mut demoted = Vec::new();
        for mut other in self.store.get_cluster_records().await? {
            if other.is_default && other.id != keep {
                other.is_default = false;
                other.updated_at = Utc::now();
                if let Err(e) = self.store.update_cluster_record(&other).await {
                    self.restore_defaults(demoted).await;
                    return Err(e);
                }
                info!("Cluster {} is no longer the default", other.id);
                demoted.push(other);
            }
        }
        Ok(demoted)
    }

    async fn restore_defaults(&self, demoted: Vec<ClusterRecord>) {
        for mut record in demoted {
            record.is_default = true;
            record.updated_at = Utc::now();
            match self.store.update_cluster_record(&record).await {
                Ok(()) => info!("Restored cluster {} as the default", record.id),
                Err(e) => warn!("Failed to restore default cluster {}: {}", record.id, e),
            }
        }
    }

    async fn ensure_single_default(&self) -> Result<()> {
        let defaults: Vec<String> = self
            .store
            .get_cluster_records()
            .await?
            .into_iter()
            .filter(|r| r.is_default)
            .map(|r| r.id)
            .collect();
        if defaults.len() > 1 {
            return Err(Error::ConflictingDefault(defaults.join(", ")));
        }
        Ok(())
    }

    /// Default connected cluster, else any connected one
    pub async fn select_cluster(&self) -> Result<Option<ClusterRecord>> {
        let records = self.store.get_cluster_records().await?;
        let mut connected = records.into_iter().filter(ClusterRecord::is_available);
        let first = connected.next();
        if first.as_ref().is_some_and(|r| r.is_default) {
            return Ok(first);
        }
        Ok(connected.find(|r| r.is_default).or(first))
    }
}

#[async_trait]
impl ClusterSource for ClusterRegistry {
    /// Selection and lease happen under the write lock, so a concurrent
    /// `remove_cluster` either sees the lease or removes the cluster first
    async fn lease_cluster(&self, environment_id: &str) -> Result<Option<ClusterRecord>> {
        let _guard = self.write_lock.lock().await;
        let selected = self.select_cluster().await?;
        if let Some(record) = &selected {
            self.leases.acquire(&record.id, environment_id);
        }
        Ok(selected)
    }
}

/// Node count plus allocatable CPU and memory summed over `nodes`
pub fn capacity_from_nodes(version: Option<String>, nodes: &[Value]) -> ClusterCapacity {
    let mut capacity = ClusterCapacity {
        version,
        node_count: nodes.len() as u32,
        ..Default::default()
    };
    for node in nodes {
        let status = node.get("status");
        let resources = status
            .and_then(|s| s.get("allocatable"))
            .or_else(|| status.and_then(|s| s.get("capacity")));
        let Some(resources) = resources else {
            continue;
        };
        if let Some(cpu) = resources.get("cpu").and_then(Value::as_str) {
            capacity.cpu_millis += parse_cpu_millis(cpu).unwrap_or(0);
        }
        if let Some(memory) = resources.get("memory").and_then(Value::as_str) {
            capacity.memory_bytes += parse_bytes(memory).unwrap_or(0);
        }
    }
    capacity
}
