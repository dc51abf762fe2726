//! Cluster backend: one virtual cluster per sandbox
//!
//! Each sandbox gets its own namespace in a parent cluster with a virtual
//! cluster inside it. Commands run through kubectl against the virtual
//! cluster's scoped kubeconfig.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{command_outcome, file_outcome, CreateEnvironmentRequest, EnvironmentProvider, EnvironmentTable};
use crate::config::Config;
use crate::domain::cluster::ClusterRecord;
use crate::domain::environment::{
    BackendHandle, BackendType, CommandResult, ConfigurationKind, Environment, EnvironmentStatus,
    ExecOptions, Health, HealthCheck, LogOptions, LogOutput, Probe, ProbeOutcome, StatusSnapshot,
};
use crate::domain::template::{NetworkingSpec, ProbeKind, ResourceRequest};
use crate::error::{Error, Result};
use crate::infra::kubectl::{
    self, access_for_cluster, kubeconfig_for, server_from_kubeconfig, KubeAccess, Kubectl,
};
use crate::infra::process::{run_checked, Invocation, ProcessRunner};

const SUPPORTED: &[ConfigurationKind] = &[ConfigurationKind::Manifest];

/// Cluster backend settings
#[derive(Debug, Clone)]
pub struct ClusterProviderConfig {
    pub kubectl_bin: String,
    pub vcluster_bin: String,
    /// Fallback parent cluster when the registry has nothing connected
    pub parent_kubeconfig: Option<String>,
    pub kubeconfig_dir: String,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
    pub settle_delay: Duration,
    pub command_timeout: Duration,
    pub seed_namespaces: Vec<String>,
}

impl ClusterProviderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            kubectl_bin: config.kubectl_bin.clone(),
            vcluster_bin: config.vcluster_bin.clone(),
            parent_kubeconfig: config.parent_kubeconfig.clone(),
            kubeconfig_dir: config.kubeconfig_dir.clone(),
            readiness_timeout: Duration::from_secs(config.readiness_timeout_secs),
            readiness_poll: Duration::from_millis(config.readiness_poll_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            seed_namespaces: config.seed_namespaces.clone(),
        }
    }
}

/// Source of registered parent clusters
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Pick the default connected cluster, else any connected one, and
    /// record a lease for `environment_id` on it in the same step
    ///
    /// The caller releases the lease through [`ClusterLeases`].
    async fn lease_cluster(&self, environment_id: &str) -> Result<Option<ClusterRecord>>;
}

/// Which sandboxes currently run on which registered cluster
#[derive(Debug, Default)]
pub struct ClusterLeases {
    leases: DashMap<String, HashSet<String>>,
}

impl ClusterLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, cluster_id: &str, environment_id: &str) {
        self.leases
            .entry(cluster_id.to_string())
            .or_default()
            .insert(environment_id.to_string());
    }

    pub fn release(&self, cluster_id: &str, environment_id: &str) {
        if let Some(mut set) = self.leases.get_mut(cluster_id) {
            set.remove(environment_id);
        }
        self.leases.remove_if(cluster_id, |_, set| set.is_empty());
    }

    pub fn count(&self, cluster_id: &str) -> usize {
        self.leases.get(cluster_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn counts(&self) -> HashMap<String, usize> {
        self.leases
            .iter()
            .map(|e| (e.key().clone(), e.value().len()))
            .collect()
    }
}

/// Parent cluster a sandbox was placed on
#[derive(Debug, Clone)]
struct ParentCluster {
    cluster_id: Option<String>,
    kubectl: Kubectl,
    /// Handed to the virtual-cluster CLI through `KUBECONFIG`
    kubeconfig: Option<String>,
}

/// Credentials kept for a live sandbox
#[derive(Debug, Clone)]
struct SandboxAccess {
    parent: ParentCluster,
    scoped: Kubectl,
}

/// Resources to release when creation fails part-way
enum Allocation {
    Lease { cluster_id: String },
    Namespace { namespace: String },
    VirtualCluster { name: String, namespace: String },
    Kubeconfig { path: String },
}

struct Provisioned {
    access: SandboxAccess,
    handle: BackendHandle,
    endpoints: HashMap<String, String>,
}

pub struct ClusterProvider {
    name: String,
    config: ClusterProviderConfig,
    runner: Arc<dyn ProcessRunner>,
    clusters: Option<Arc<dyn ClusterSource>>,
    leases: Arc<ClusterLeases>,
    table: EnvironmentTable,
    access: DashMap<String, SandboxAccess>,
}

impl ClusterProvider {
    pub fn new(
        name: impl Into<String>,
        config: ClusterProviderConfig,
        runner: Arc<dyn ProcessRunner>,
        clusters: Option<Arc<dyn ClusterSource>>,
        leases: Arc<ClusterLeases>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            runner,
            clusters,
            leases,
            table: EnvironmentTable::new(),
            access: DashMap::new(),
        }
    }

    async fn select_parent(&self, environment_id: &str) -> Result<ParentCluster> {
        if let Some(source) = &self.clusters {
            if let Some(record) = source.lease_cluster(environment_id).await? {
                debug!("Placing environment {} on cluster {}", environment_id, record.name);
                return match self.parent_access(&record).await {
                    Ok(parent) => Ok(parent),
                    Err(e) => {
                        self.leases.release(&record.id, environment_id);
                        Err(e)
                    }
                };
            }
        }

        let access = match &self.config.parent_kubeconfig {
            Some(path) => KubeAccess::Kubeconfig(path.clone()),
            None => KubeAccess::Ambient,
        };
        Ok(ParentCluster {
            cluster_id: None,
            kubectl: Kubectl::new(&self.config.kubectl_bin, access),
            kubeconfig: self.config.parent_kubeconfig.clone(),
        })
    }

    async fn parent_access(&self, record: &ClusterRecord) -> Result<ParentCluster> {
        let access = access_for_cluster(record, &self.config.kubeconfig_dir).await?;
        let kubeconfig = kubeconfig_for(
            &access,
            &self.config.kubeconfig_dir,
            &format!("cluster-{}-token", record.id),
        )
        .await?;
        Ok(ParentCluster {
            cluster_id: Some(record.id.clone()),
            kubectl: Kubectl::new(&self.config.kubectl_bin, access),
            kubeconfig,
        })
    }

    fn vcluster(&self, parent: &ParentCluster) -> Invocation {
        let inv = Invocation::new(&self.config.vcluster_bin);
        match &parent.kubeconfig {
            Some(path) => inv.env("KUBECONFIG", path),
            None => inv,
        }
    }

    async fn provision(
        &self,
        environment: &Environment,
        request: &CreateEnvironmentRequest,
        parent: &ParentCluster,
        undo: &mut Vec<Allocation>,
    ) -> Result<Provisioned> {
        let id = &environment.id;
        let namespace = format!("workshop-{}", id);
        let vcluster_name = format!("vc-{}", &id[..8.min(id.len())]);
        let config = &request.config;

        // Taken by `select_parent`
        if let Some(cluster_id) = &parent.cluster_id {
            undo.push(Allocation::Lease {
                cluster_id: cluster_id.clone(),
            });
        }

        // 1. namespace
        run_checked(
            self.runner.as_ref(),
            parent
                .kubectl
                .invocation(["create", "namespace", namespace.as_str()])
                .timeout(self.config.command_timeout),
        )
        .await?;
        undo.push(Allocation::Namespace {
            namespace: namespace.clone(),
        });
        debug!("Created namespace {}", namespace);

        // 2. virtual cluster
        let create = self
            .vcluster(parent)
            .args([
                "create",
                vcluster_name.as_str(),
                "--namespace",
                namespace.as_str(),
                "--connect=false",
            ])
            .args(vcluster_values(&config.resources, &config.networking))
            .timeout(self.config.readiness_timeout);
        run_checked(self.runner.as_ref(), create).await?;
        undo.push(Allocation::VirtualCluster {
            name: vcluster_name.clone(),
            namespace: namespace.clone(),
        });
        info!("Virtual cluster {} provisioning in {}", vcluster_name, namespace);

        // 3. readiness
        self.wait_until_running(parent, &vcluster_name, &namespace)
            .await?;
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        // 4. scoped credential
        let connect = self
            .vcluster(parent)
            .args([
                "connect",
                vcluster_name.as_str(),
                "--namespace",
                namespace.as_str(),
                "--print",
            ])
            .timeout(self.config.command_timeout);
        let kubeconfig = run_checked(self.runner.as_ref(), connect).await?.stdout;
        let kubeconfig_path =
            kubectl::write_kubeconfig(&self.config.kubeconfig_dir, id, &kubeconfig).await?;
        undo.push(Allocation::Kubeconfig {
            path: kubeconfig_path.clone(),
        });
        let scoped = Kubectl::new(
            &self.config.kubectl_bin,
            KubeAccess::Kubeconfig(kubeconfig_path.clone()),
        );

        // 5. baseline namespaces and role binding
        run_checked(
            self.runner.as_ref(),
            scoped
                .invocation(["apply", "-f", "-"])
                .stdin(seed_manifest(&self.config.seed_namespaces))
                .timeout(self.config.command_timeout),
        )
        .await?;

        // 6. init scripts, best-effort
        for (index, script) in config.init_scripts.iter().enumerate() {
            let inv = Invocation::new("sh")
                .args(["-c", script.as_str()])
                .envs(&config.env)
                .env("KUBECONFIG", &kubeconfig_path)
                .timeout(self.config.command_timeout);
            match self.runner.run(inv).await {
                Ok(result) if result.success() => {
                    debug!("Init script {} finished for environment {}", index, id);
                }
                Ok(result) => warn!(
                    "Init script {} exited with {} for environment {}: {}",
                    index,
                    result.exit_code,
                    id,
                    result.stderr.trim()
                ),
                Err(e) => warn!("Init script {} failed for environment {}: {}", index, id, e),
            }
        }

        // 7. endpoint
        let server = server_from_kubeconfig(&kubeconfig).ok_or_else(|| {
            Error::ProvisioningFailed("Virtual cluster kubeconfig has no server entry".to_string())
        })?;
        let endpoints = HashMap::from([("api".to_string(), server)]);

        Ok(Provisioned {
            handle: BackendHandle::Cluster {
                cluster_id: parent.cluster_id.clone(),
                namespace,
                vcluster_name,
                kubeconfig_path,
            },
            access: SandboxAccess {
                parent: parent.clone(),
                scoped,
            },
            endpoints,
        })
    }

    async fn wait_until_running(
        &self,
        parent: &ParentCluster,
        vcluster_name: &str,
        namespace: &str,
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.readiness_timeout;
        let selector = format!("app=vcluster,release={}", vcluster_name);

        loop {
            let inv = parent
                .kubectl
                .invocation(["get", "pods", "-n", namespace, "-l", selector.as_str(), "-o", "json"])
                .timeout(self.config.command_timeout);
            match self.runner.run(inv).await {
                Ok(result) if result.success() => {
                    let pods = kubectl::parse_json(&result.stdout)?;
                    let (total, running) = count_running(&pods);
                    if total > 0 && running == total {
                        info!("Virtual cluster {} control plane is running", vcluster_name);
                        return Ok(());
                    }
                    debug!(
                        "Virtual cluster {} not ready yet ({}/{} pods running)",
                        vcluster_name, running, total
                    );
                }
                Ok(result) => debug!("Readiness poll failed: {}", result.stderr.trim()),
                Err(e) => debug!("Readiness poll failed: {}", e),
            }

            if Instant::now() >= deadline {
                return Err(Error::ProvisioningFailed(format!(
                    "Virtual cluster {} not ready within {}s",
                    vcluster_name,
                    self.config.readiness_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.config.readiness_poll).await;
        }
    }

    /// Undo allocations in reverse order; failures are logged
    async fn rollback(&self, environment_id: &str, parent: &ParentCluster, undo: Vec<Allocation>) {
        for allocation in undo.into_iter().rev() {
            let outcome = match &allocation {
                Allocation::Lease { cluster_id } => {
                    self.leases.release(cluster_id, environment_id);
                    Ok(())
                }
                Allocation::Kubeconfig { path } => kubectl::remove_kubeconfig(path).await,
                Allocation::VirtualCluster { name, namespace } => {
                    self.delete_vcluster(parent, name, namespace).await
                }
                Allocation::Namespace { namespace } => self.delete_namespace(parent, namespace).await,
            };
            if let Err(e) = outcome {
                warn!("Rollback step failed for environment {}: {}", environment_id, e);
            }
        }
    }

    async fn delete_vcluster(&self, parent: &ParentCluster, name: &str, namespace: &str) -> Result<()> {
        let inv = self
            .vcluster(parent)
            .args(["delete", name, "--namespace", namespace])
            .timeout(self.config.readiness_timeout);
        let result = self.runner.run(inv).await?;
        if !result.success() && !is_not_found(&result.stderr) {
            return Err(Error::CommandFailed {
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn delete_namespace(&self, parent: &ParentCluster, namespace: &str) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            parent
                .kubectl
                .invocation(["delete", "namespace", namespace, "--ignore-not-found", "--wait=false"])
                .timeout(self.config.command_timeout),
        )
        .await?;
        Ok(())
    }

    async fn teardown(&self, environment: &Environment, access: Option<SandboxAccess>) -> Result<()> {
        let (
            Some(BackendHandle::Cluster {
                namespace,
                vcluster_name,
                kubeconfig_path,
                ..
            }),
            Some(access),
        ) = (&environment.handle, access)
        else {
            return Ok(());
        };

        self.delete_vcluster(&access.parent, vcluster_name, namespace)
            .await?;
        self.delete_namespace(&access.parent, namespace).await?;
        kubectl::remove_kubeconfig(kubeconfig_path).await?;
        if let Some(cluster_id) = &access.parent.cluster_id {
            self.leases.release(cluster_id, &environment.id);
        }
        Ok(())
    }

    fn scoped(&self, id: &str) -> Result<Kubectl> {
        self.table.require_ready(id)?;
        self.access
            .get(id)
            .map(|a| a.scoped.clone())
            .ok_or_else(|| Error::EnvironmentNotFound(id.to_string()))
    }

    fn timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.command_timeout)
    }

    async fn get_json(&self, kubectl: &Kubectl, args: &[&str]) -> Result<Value> {
        let result = run_checked(
            self.runner.as_ref(),
            kubectl
                .invocation(args.iter().copied())
                .timeout(self.config.command_timeout),
        )
        .await?;
        kubectl::parse_json(&result.stdout)
    }

    async fn first_pod(&self, kubectl: &Kubectl, namespace: &str) -> Result<String> {
        let pods = self
            .get_json(kubectl, &["get", "pods", "-n", namespace, "-o", "json"])
            .await?;
        kubectl::items(&pods)
            .iter()
            .find_map(|pod| pod["metadata"]["name"].as_str().map(str::to_string))
            .ok_or_else(|| Error::InvalidRequest(format!("No pods in namespace {}", namespace)))
    }
}

#[async_trait]
impl EnvironmentProvider for ClusterProvider {
    fn backend(&self) -> BackendType {
        BackendType::Cluster
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn create_environment(&self, request: CreateEnvironmentRequest) -> Result<Environment> {
        let id = Uuid::new_v4().to_string();
        let environment = Environment::new(
            id.clone(),
            request.session_id.clone(),
            BackendType::Cluster,
            &request.config,
        );
        self.table.insert(environment.clone());
        info!(
            "Creating cluster environment {} for session {} (template {}, user {})",
            id, request.session_id, request.template_id, request.user_id
        );

        let parent = match self.select_parent(&id).await {
            Ok(parent) => parent,
            Err(e) => {
                error!("No parent cluster for environment {}: {}", id, e);
                self.table.remove(&id);
                return Err(Error::ProvisioningFailed(e.to_string()));
            }
        };

        let mut undo = Vec::new();
        match self.provision(&environment, &request, &parent, &mut undo).await {
            Ok(provisioned) => {
                self.access.insert(id.clone(), provisioned.access);
                let ready = self.table.update(&id, |env| {
                    env.handle = Some(provisioned.handle);
                    env.endpoints = provisioned.endpoints;
                    env.transition_to(EnvironmentStatus::Ready);
                })?;
                info!("Cluster environment {} is ready", id);
                Ok(ready)
            }
            Err(e) => {
                error!("Failed to create cluster environment {}: {}", id, e);
                self.rollback(&id, &parent, undo).await;
                self.table.remove(&id);
                Err(match e {
                    Error::ProvisioningFailed(_) => e,
                    other => Error::ProvisioningFailed(other.to_string()),
                })
            }
        }
    }

    async fn destroy_environment(&self, id: &str) -> Result<()> {
        let Some(environment) = self.table.begin_destroy(id) else {
            debug!("Cluster environment {} already gone", id);
            return Ok(());
        };

        info!("Destroying cluster environment {}", id);
        let access = self.access.get(id).map(|a| a.clone());
        match self.teardown(&environment, access).await {
            Ok(()) => {
                self.table.remove(id);
                self.access.remove(id);
                info!("Cluster environment {} destroyed", id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to destroy cluster environment {}: {}", id, e);
                self.table.restore_failed(environment, e.to_string());
                Err(e)
            }
        }
    }

    async fn execute_command(
        &self,
        id: &str,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        let scoped = self.scoped(id)?;
        let mut args = argv.into_iter().peekable();
        if args.peek().map(String::as_str) == Some("kubectl") {
            args.next();
        }
        let args: Vec<String> = args.collect();
        if args.is_empty() {
            return Err(Error::InvalidRequest("Empty command".to_string()));
        }

        let inv = scoped
            .invocation(args)
            .envs(&options.env)
            .timeout(self.timeout(options.timeout_ms));
        let result = self.runner.run(inv).await;
        self.table.touch(id);
        result
    }

    async fn get_logs(
        &self,
        id: &str,
        target: Option<&str>,
        options: &LogOptions,
    ) -> Result<LogOutput> {
        let scoped = self.scoped(id)?;
        let (namespace, pod) = match target.map(|t| t.split_once('/').unwrap_or(("default", t))) {
            Some((namespace, pod)) => (namespace.to_string(), pod.to_string()),
            None => ("default".to_string(), self.first_pod(&scoped, "default").await?),
        };

        let mut args = vec!["logs".to_string(), pod, "-n".to_string(), namespace];
        if let Some(tail) = options.tail {
            args.push(format!("--tail={}", tail));
        }
        if let Some(since) = &options.since {
            args.push(format!("--since={}", since));
        }
        self.table.touch(id);

        if options.follow {
            args.push("-f".to_string());
            let stream = self.runner.stream(scoped.invocation(args)).await?;
            return Ok(LogOutput::Stream(stream));
        }

        let result = run_checked(
            self.runner.as_ref(),
            scoped.invocation(args).timeout(self.config.command_timeout),
        )
        .await?;
        Ok(LogOutput::Text(result.stdout))
    }

    async fn apply_configuration(
        &self,
        id: &str,
        payload: &str,
        kind: ConfigurationKind,
    ) -> Result<()> {
        self.check_configuration_kind(kind)?;
        let scoped = self.scoped(id)?;

        run_checked(
            self.runner.as_ref(),
            scoped
                .invocation(["apply", "-f", "-"])
                .stdin(payload)
                .timeout(self.config.command_timeout),
        )
        .await?;
        self.table.touch(id);
        info!("Applied manifest to cluster environment {}", id);
        Ok(())
    }

    async fn get_environment_status(&self, id: &str) -> Result<StatusSnapshot> {
        let environment = self
            .table
            .get(id)
            .ok_or_else(|| Error::EnvironmentNotFound(id.to_string()))?;

        if !environment.is_ready() {
            return Ok(StatusSnapshot {
                environment_id: environment.id,
                status: environment.status,
                health: Health::Unhealthy,
                checks: vec![HealthCheck::new(
                    "environment",
                    false,
                    environment.status.as_str(),
                )],
                endpoints: environment.endpoints,
                observed_at: Utc::now(),
            });
        }

        let scoped = self.scoped(id)?;
        let pods = self
            .get_json(&scoped, &["get", "pods", "--all-namespaces", "-o", "json"])
            .await?;
        let services = self
            .get_json(&scoped, &["get", "services", "--all-namespaces", "-o", "json"])
            .await?;
        // Virtual clusters may not expose nodes
        let nodes = match self.get_json(&scoped, &["get", "nodes", "-o", "json"]).await {
            Ok(nodes) => kubectl::items(&nodes).len(),
            Err(e) => {
                debug!("Node listing unavailable for {}: {}", id, e);
                0
            }
        };

        let (total, running) = count_running(&pods);
        let checks = vec![
            HealthCheck::new(
                "pods",
                total == running,
                format!("{}/{} running", running, total),
            ),
            HealthCheck::new(
                "services",
                true,
                format!("{} services", kubectl::items(&services).len()),
            ),
            HealthCheck::new("nodes", true, format!("{} visible", nodes)),
        ];

        Ok(StatusSnapshot {
            environment_id: environment.id,
            status: environment.status,
            health: derive_health(total, running),
            checks,
            endpoints: environment.endpoints,
            observed_at: Utc::now(),
        })
    }

    async fn probe(&self, id: &str, probe: &Probe) -> Result<ProbeOutcome> {
        let scoped = self.scoped(id)?;
        let timeout = self.timeout(probe.timeout_ms);
        let target = super::split_command(&probe.target);
        let target: Vec<&str> = target
            .iter()
            .map(String::as_str)
            .skip_while(|w| *w == "kubectl")
            .collect();
        self.table.touch(id);

        match probe.kind {
            ProbeKind::ResourceExists | ProbeKind::ResourceStatus => {
                let inv = scoped
                    .invocation(["get"])
                    .args(target.iter().copied())
                    .args(["-o", "json"])
                    .timeout(timeout);
                let result = self.runner.run(inv).await?;
                if !result.success() {
                    if is_not_found(&result.stderr) {
                        return Ok(ProbeOutcome {
                            found: false,
                            actual: Value::Null,
                            detail: format!("{} not found", probe.target),
                        });
                    }
                    return Err(Error::ValidationError(result.stderr.trim().to_string()));
                }
                let resource = kubectl::parse_json(&result.stdout)?;
                let actual = match probe.kind {
                    ProbeKind::ResourceStatus => {
                        resource.get("status").cloned().unwrap_or(resource)
                    }
                    _ => resource,
                };
                Ok(ProbeOutcome {
                    found: true,
                    actual,
                    detail: format!("{} found", probe.target),
                })
            }
            ProbeKind::EndpointReachable => {
                let inv = scoped
                    .invocation(["get", "endpoints"])
                    .args(target.iter().copied())
                    .args(["-o", "json"])
                    .timeout(timeout);
                let result = self.runner.run(inv).await?;
                if !result.success() {
                    if is_not_found(&result.stderr) {
                        return Ok(ProbeOutcome {
                            found: false,
                            actual: Value::Bool(false),
                            detail: format!("No endpoints for {}", probe.target),
                        });
                    }
                    return Err(Error::ValidationError(result.stderr.trim().to_string()));
                }
                let endpoints = kubectl::parse_json(&result.stdout)?;
                let ready = endpoints["subsets"]
                    .as_array()
                    .map(|subsets| {
                        subsets.iter().any(|s| {
                            s["addresses"].as_array().map(|a| !a.is_empty()).unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                Ok(ProbeOutcome {
                    found: ready,
                    actual: Value::Bool(ready),
                    detail: if ready {
                        format!("{} has ready endpoints", probe.target)
                    } else {
                        format!("{} has no ready endpoints", probe.target)
                    },
                })
            }
            ProbeKind::FileContent => {
                let (location, path) = probe.target.split_once(':').ok_or_else(|| {
                    Error::ValidationError(format!(
                        "File target must be <pod>:<path>, got {}",
                        probe.target
                    ))
                })?;
                let (namespace, pod) = location.split_once('/').unwrap_or(("default", location));
                let inv = scoped
                    .invocation(["exec", "-n", namespace, pod, "--", "cat", path])
                    .timeout(timeout);
                let result = self.runner.run(inv).await?;
                Ok(file_outcome(path, result))
            }
            ProbeKind::Custom => {
                if target.is_empty() {
                    return Err(Error::ValidationError("Empty custom probe".to_string()));
                }
                let inv = scoped.invocation(target.iter().copied()).timeout(timeout);
                let result = self.runner.run(inv).await?;
                Ok(command_outcome(result))
            }
        }
    }

    fn get_environment(&self, id: &str) -> Option<Environment> {
        self.table.get(id)
    }

    fn environment_ids(&self) -> Vec<String> {
        self.table.ids()
    }

    fn supported_configurations(&self) -> &'static [ConfigurationKind] {
        SUPPORTED
    }
}

/// Helm-style overrides sizing the virtual cluster
fn vcluster_values(resources: &ResourceRequest, networking: &NetworkingSpec) -> Vec<String> {
    let mut values = vec![
        format!("controlPlane.statefulSet.resources.limits.cpu={}", resources.cpu),
        format!("controlPlane.statefulSet.resources.limits.memory={}", resources.memory),
        format!(
            "controlPlane.statefulSet.persistence.volumeClaim.size={}",
            resources.storage
        ),
        format!("controlPlane.ingress.enabled={}", networking.ingress),
    ];
    if networking.load_balancer {
        values.push("controlPlane.service.spec.type=LoadBalancer".to_string());
    }
    values
        .into_iter()
        .flat_map(|v| ["--set".to_string(), v])
        .collect()
}

/// Baseline namespaces plus an edit binding for the default service account
fn seed_manifest(namespaces: &[String]) -> String {
    let mut docs: Vec<String> = namespaces
        .iter()
        .map(|ns| {
            format!(
                "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}\n  labels:\n    workshop.managed: \"true\"\n",
                ns
            )
        })
        .collect();
    docs.push(
        "apiVersion: rbac.authorization.k8s.io/v1\n\
         kind: RoleBinding\n\
         metadata:\n  name: workshop-default-edit\n  namespace: default\n\
         roleRef:\n  apiGroup: rbac.authorization.k8s.io\n  kind: ClusterRole\n  name: edit\n\
         subjects:\n- kind: ServiceAccount\n  name: default\n  namespace: default\n"
            .to_string(),
    );
    docs.join("---\n")
}

/// (total, running) pod counts of a kubectl pod list
fn count_running(pods: &Value) -> (usize, usize) {
    let items = kubectl::items(pods);
    let running = items
        .iter()
        .filter(|p| p["status"]["phase"].as_str() == Some("Running"))
        .count();
    (items.len(), running)
}

/// Healthy when every pod runs (or there are none), degraded when some do
pub fn derive_health(total: usize, running: usize) -> Health {
    if running == total {
        Health::Healthy
    } else if running > 0 {
        Health::Degraded
    } else {
        Health::Unhealthy
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("notfound") || lower.contains("not found")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::domain::cluster::{
        ClusterCredential, ClusterStatus, CreateClusterParams, TokenCredential,
    };
    use crate::domain::environment::EnvironmentConfig;
    use crate::infra::process::MockProcessRunner;

    const KUBECONFIG: &str = "apiVersion: v1\nclusters:\n- cluster:\n    server: https://vc.local:443\n  name: vc\n";

    fn test_config(dir: &str) -> ClusterProviderConfig {
        ClusterProviderConfig {
            kubectl_bin: "kubectl".into(),
            vcluster_bin: "vcluster".into(),
            parent_kubeconfig: None,
            kubeconfig_dir: dir.into(),
            readiness_timeout: Duration::from_millis(50),
            readiness_poll: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            command_timeout: Duration::from_secs(5),
            seed_namespaces: vec!["workshop".into()],
        }
    }

    fn scratch_dir() -> String {
        std::env::temp_dir()
            .join(format!("workshop-test-{}", Uuid::new_v4()))
            .to_string_lossy()
            .to_string()
    }

    fn ok(stdout: &str) -> CommandResult {
        CommandResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
        }
    }

    fn failed(stderr: &str) -> CommandResult {
        CommandResult {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: 1,
            duration_ms: 1,
        }
    }

    /// Runner that answers like a healthy toolchain, failing any invocation
    /// containing `fail_on`
    fn scripted_runner(fail_on: Option<&'static [&'static str]>, log: Arc<Mutex<Vec<String>>>) -> MockProcessRunner {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(move |inv| {
            log.lock().unwrap().push(format!("{:?}", inv));
            if let Some(needle) = fail_on {
                if inv.has_args(needle) {
                    return Ok(failed("boom"));
                }
            }
            if inv.has_args(&["connect"]) {
                return Ok(ok(KUBECONFIG));
            }
            if inv.has_args(&["get", "pods"]) {
                return Ok(ok(&json!({"items": [
                    {"metadata": {"name": "vc-0"}, "status": {"phase": "Running"}}
                ]})
                .to_string()));
            }
            if inv.has_args(&["get", "services"]) || inv.has_args(&["get", "nodes"]) {
                return Ok(ok(r#"{"items": []}"#));
            }
            Ok(ok(""))
        });
        runner
    }

    fn request(init_scripts: Vec<String>) -> CreateEnvironmentRequest {
        CreateEnvironmentRequest {
            session_id: "s1".into(),
            template_id: "t1".into(),
            user_id: "u1".into(),
            config: EnvironmentConfig {
                init_scripts,
                ..Default::default()
            },
        }
    }

    fn provider(runner: MockProcessRunner, dir: &str) -> ClusterProvider {
        ClusterProvider::new(
            "default",
            test_config(dir),
            Arc::new(runner),
            None,
            Arc::new(ClusterLeases::new()),
        )
    }

    #[tokio::test]
    async fn test_create_runs_steps_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dir = scratch_dir();
        let provider = provider(scripted_runner(None, log.clone()), &dir);

        let env = provider
            .create_environment(request(vec!["exit 3".into()]))
            .await
            .expect("creation should tolerate init script failure");

        assert_eq!(env.status, EnvironmentStatus::Ready);
        assert_eq!(env.endpoints.get("api").map(String::as_str), Some("https://vc.local:443"));

        let log = log.lock().unwrap();
        let position = |needle: &str| {
            log.iter()
                .position(|l| l.contains(needle))
                .unwrap_or_else(|| panic!("missing {}", needle))
        };
        assert!(position("create namespace") < position("vcluster create"));
        assert!(position("vcluster create") < position("get pods"));
        assert!(position("get pods") < position("vcluster connect"));
        assert!(position("vcluster connect") < position("apply -f -"));
        assert!(position("apply -f -") < position("sh -c exit 3"));
        assert!(log.iter().any(|l| l.contains("--connect=false")));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dir = scratch_dir();
        let provider = provider(
            scripted_runner(Some(&["apply", "-f", "-"]), log.clone()),
            &dir,
        );

        let err = provider
            .create_environment(request(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProvisioningFailed(_)));
        assert!(provider.environment_ids().is_empty());

        let log = log.lock().unwrap();
        let vc_delete = log
            .iter()
            .position(|l| l.contains("vcluster delete"))
            .expect("virtual cluster removed");
        let ns_delete = log
            .iter()
            .position(|l| l.contains("delete namespace"))
            .expect("namespace removed");
        assert!(vc_delete < ns_delete);

        let leftover = std::fs::read_dir(&dir)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0, "kubeconfig removed");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_provisioning_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dir = scratch_dir();
        let provider = provider(scripted_runner(Some(&["get", "pods"]), log.clone()), &dir);

        let err = provider
            .create_environment(request(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProvisioningFailed(_)));
        assert!(log.lock().unwrap().iter().any(|l| l.contains("vcluster delete")));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dir = scratch_dir();
        let provider = provider(scripted_runner(None, log.clone()), &dir);

        let env = provider.create_environment(request(vec![])).await.unwrap();
        provider.destroy_environment(&env.id).await.unwrap();
        provider.destroy_environment(&env.id).await.unwrap();
        provider.destroy_environment("never-existed").await.unwrap();

        let deletes = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains("vcluster delete"))
            .count();
        assert_eq!(deletes, 1);
        assert!(provider.get_environment(&env.id).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_execute_uses_scoped_credentials() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dir = scratch_dir();
        let provider = provider(scripted_runner(None, log.clone()), &dir);
        let env = provider.create_environment(request(vec![])).await.unwrap();

        provider
            .execute_command(
                &env.id,
                vec!["kubectl".into(), "get".into(), "ns".into()],
                ExecOptions::default(),
            )
            .await
            .unwrap();

        let log = log.lock().unwrap();
        let last = log.last().unwrap();
        assert!(last.starts_with("kubectl --kubeconfig"));
        assert!(last.ends_with("get ns"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_manifest_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dir = scratch_dir();
        let provider = provider(scripted_runner(None, log), &dir);
        let env = provider.create_environment(request(vec![])).await.unwrap();

        let err = provider
            .apply_configuration(&env.id, "FROM alpine", ConfigurationKind::BuildSpec)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration { .. }));

        provider
            .apply_configuration(&env.id, "kind: ConfigMap", ConfigurationKind::Manifest)
            .await
            .unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_status_reports_health() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dir = scratch_dir();
        let provider = provider(scripted_runner(None, log), &dir);
        let env = provider.create_environment(request(vec![])).await.unwrap();

        let status = provider.get_environment_status(&env.id).await.unwrap();
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.checks.len(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_follow_logs_streams_first_pod() {
        let dir = scratch_dir();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut runner = scripted_runner(None, log);
        runner.expect_stream().returning(|inv| {
            assert!(inv.has_args(&["logs", "vc-0"]));
            assert!(inv.has_args(&["-f"]));
            Ok(futures::stream::iter(vec![Ok("hello\n".to_string())]).boxed())
        });
        let provider = provider(runner, &dir);
        let env = provider.create_environment(request(vec![])).await.unwrap();

        let output = provider
            .get_logs(
                &env.id,
                None,
                &LogOptions {
                    follow: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let LogOutput::Stream(stream) = output else {
            panic!("expected a stream");
        };
        let lines: Vec<String> = stream.map(|l| l.unwrap()).collect().await;
        assert_eq!(lines, vec!["hello\n"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_probe_missing_resource_is_evaluated() {
        let dir = scratch_dir();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|inv| {
            if inv.has_args(&["get", "deployment/web"]) {
                return Ok(failed("Error from server (NotFound): deployments.apps \"web\" not found"));
            }
            scripted_answer(&inv)
        });
        let provider = provider(runner, &dir);
        let env = provider.create_environment(request(vec![])).await.unwrap();

        let outcome = provider
            .probe(
                &env.id,
                &Probe {
                    kind: ProbeKind::ResourceExists,
                    target: "deployment/web".into(),
                    timeout_ms: None,
                },
            )
            .await
            .unwrap();
        assert!(!outcome.found);
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn scripted_answer(inv: &Invocation) -> Result<CommandResult> {
        if inv.has_args(&["connect"]) {
            return Ok(ok(KUBECONFIG));
        }
        if inv.has_args(&["get", "pods"]) {
            return Ok(ok(&json!({"items": [{"metadata": {"name": "p"}, "status": {"phase": "Running"}}]}).to_string()));
        }
        Ok(ok(""))
    }

    struct StaticClusters(ClusterRecord, Arc<ClusterLeases>);

    #[async_trait]
    impl ClusterSource for StaticClusters {
        async fn lease_cluster(&self, environment_id: &str) -> Result<Option<ClusterRecord>> {
            self.1.acquire(&self.0.id, environment_id);
            Ok(Some(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_registered_cluster_is_leased_until_destroy() {
        let dir = scratch_dir();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut record = ClusterRecord::new(
            "c1".into(),
            CreateClusterParams {
                name: "primary".into(),
                endpoint: "https://parent:6443".into(),
                credential: ClusterCredential::Token(TokenCredential::new("t")),
                namespace: "default".into(),
                is_default: true,
            },
        );
        record.status = ClusterStatus::Connected;
        let leases = Arc::new(ClusterLeases::new());
        let provider = ClusterProvider::new(
            "default",
            test_config(&dir),
            Arc::new(scripted_runner(None, log.clone())),
            Some(Arc::new(StaticClusters(record, leases.clone()))),
            leases.clone(),
        );

        let env = provider.create_environment(request(vec![])).await.unwrap();
        assert_eq!(leases.count("c1"), 1);
        assert!(log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("kubectl --server https://parent:6443 --token *** create namespace")));

        provider.destroy_environment(&env.id).await.unwrap();
        assert_eq!(leases.count("c1"), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_health_derivation() {
        assert_eq!(derive_health(0, 0), Health::Healthy);
        assert_eq!(derive_health(3, 3), Health::Healthy);
        assert_eq!(derive_health(3, 1), Health::Degraded);
        assert_eq!(derive_health(3, 0), Health::Unhealthy);
    }

    #[test]
    fn test_vcluster_values_disable_ingress_by_default() {
        let values = vcluster_values(&ResourceRequest::default(), &NetworkingSpec::default());
        assert!(values.contains(&"controlPlane.ingress.enabled=false".to_string()));
        assert!(values.contains(&"controlPlane.statefulSet.resources.limits.cpu=500m".to_string()));
        assert!(!values.iter().any(|v| v.contains("LoadBalancer")));
        assert_eq!(values.iter().filter(|v| *v == "--set").count(), 4);
    }

    #[test]
    fn test_leases() {
        let leases = ClusterLeases::new();
        leases.acquire("c1", "e1");
        leases.acquire("c1", "e2");
        leases.acquire("c1", "e2");
        assert_eq!(leases.count("c1"), 2);
        leases.release("c1", "e1");
        leases.release("c1", "e2");
        assert_eq!(leases.count("c1"), 0);
        assert!(leases.counts().is_empty());
    }
}
