//! Container backend: network + container + volumes per sandbox

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    command_outcome, file_outcome, sandbox_labels, CreateEnvironmentRequest, EnvironmentProvider,
    EnvironmentTable,
};
use crate::config::Config;
use crate::domain::environment::{
    BackendHandle, BackendType, CommandResult, ConfigurationKind, Environment, EnvironmentStatus,
    ExecOptions, Health, HealthCheck, LogOptions, LogOutput, Probe, ProbeOutcome, StatusSnapshot,
};
use crate::domain::quantity::{cpu_to_nano_cpus, parse_bytes};
use crate::domain::template::ProbeKind;
use crate::error::{Error, Result};
use crate::infra::docker::{ContainerEngine, CreateContainerOpts};
use crate::infra::process::{run_checked, Invocation, ProcessRunner};

const SUPPORTED: &[ConfigurationKind] = &[ConfigurationKind::BuildSpec, ConfigurationKind::ComposeSpec];

/// Keeps shell images alive so commands can be exec'd into them
const KEEP_ALIVE: &[&str] = &["sleep", "infinity"];

/// Container backend settings
#[derive(Debug, Clone)]
pub struct ContainerProviderConfig {
    /// Image for templates whose kind has no mapping
    pub default_image: String,
    pub allow_privileged: bool,
    pub command_timeout: Duration,
    /// Container CLI used for compose stacks
    pub docker_bin: String,
    pub docker_socket: Option<String>,
}

impl ContainerProviderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_image: config.default_container_image.clone(),
            allow_privileged: config.allow_privileged,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            docker_bin: config.docker_bin.clone(),
            docker_socket: config.docker_socket.clone(),
        }
    }
}

/// Base image and command for a template kind
pub fn image_for_kind(kind: Option<&str>, default_image: &str) -> (String, Option<Vec<String>>) {
    let keep_alive = || Some(KEEP_ALIVE.iter().map(|s| s.to_string()).collect());
    match kind.map(str::to_lowercase).as_deref() {
        Some("linux") | Some("shell") => ("ubuntu:22.04".to_string(), keep_alive()),
        // dind runs its own daemon as the entrypoint
        Some("docker") => ("docker:24-dind".to_string(), None),
        Some("kubernetes") | Some("kubectl") => ("alpine/k8s:1.29.2".to_string(), keep_alive()),
        Some("python") => ("python:3.12-slim".to_string(), keep_alive()),
        Some("node") | Some("nodejs") => ("node:20-slim".to_string(), keep_alive()),
        _ => (default_image.to_string(), keep_alive()),
    }
}

/// Resources to release when creation fails part-way
enum Allocation {
    Network(String),
    Volume(String),
    Container(String),
}

struct Provisioned {
    handle: BackendHandle,
    endpoints: HashMap<String, String>,
}

pub struct ContainerProvider {
    name: String,
    config: ContainerProviderConfig,
    engine: Arc<dyn ContainerEngine>,
    runner: Arc<dyn ProcessRunner>,
    table: EnvironmentTable,
}

impl ContainerProvider {
    pub fn new(
        name: impl Into<String>,
        config: ContainerProviderConfig,
        engine: Arc<dyn ContainerEngine>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            engine,
            runner,
            table: EnvironmentTable::new(),
        }
    }

    async fn provision(
        &self,
        environment: &Environment,
        request: &CreateEnvironmentRequest,
        undo: &mut Vec<Allocation>,
    ) -> Result<Provisioned> {
        let short = short_id(&environment.id);
        let config = &request.config;
        let labels = sandbox_labels(request, &environment.id);

        let network_id = self
            .engine
            .create_network(&format!("workshop-{}", short), labels.clone())
            .await?;
        undo.push(Allocation::Network(network_id.clone()));

        let mut mounts = HashMap::new();
        let mut volume_ids = Vec::new();
        for volume in &config.volumes {
            let name = format!("workshop-{}-{}", short, volume.name);
            let id = self.engine.create_volume(&name, labels.clone()).await?;
            undo.push(Allocation::Volume(id.clone()));
            mounts.insert(id.clone(), volume.mount_path.clone());
            volume_ids.push(id);
        }

        let (image, cmd) = image_for_kind(config.kind.as_deref(), &self.config.default_image);
        if config.privileged && !self.config.allow_privileged {
            warn!(
                "Template requests privileged mode but the backend does not permit it; environment {} runs unprivileged",
                environment.id
            );
        }

        let mut env = config.env.clone();
        env.insert("WORKSHOP_ENVIRONMENT_ID".to_string(), environment.id.clone());
        env.insert("WORKSHOP_SESSION_ID".to_string(), request.session_id.clone());

        let container_id = self
            .engine
            .create_container(CreateContainerOpts {
                name: format!("workshop-{}", short),
                image,
                env,
                volumes: mounts,
                cmd,
                labels,
                network: Some(network_id.clone()),
                memory_limit: parse_bytes(&config.resources.memory).map(|b| b as i64),
                nano_cpus: cpu_to_nano_cpus(&config.resources.cpu),
                ports: config.networking.ports.clone(),
                privileged: config.privileged && self.config.allow_privileged,
            })
            .await?;
        undo.push(Allocation::Container(container_id.clone()));

        self.engine.start_container(&container_id).await?;

        let inspection = self.engine.inspect_container(&container_id).await?;
        if !inspection.running {
            return Err(Error::ProvisioningFailed(format!(
                "Container {} exited during startup",
                container_id
            )));
        }

        let endpoints = inspection
            .ports
            .into_iter()
            .map(|(port, host)| {
                let port = port.split('/').next().unwrap_or(&port).to_string();
                (port, host)
            })
            .collect();

        for (index, script) in config.init_scripts.iter().enumerate() {
            let argv = vec!["sh".to_string(), "-c".to_string(), script.clone()];
            match self
                .engine
                .exec(&container_id, argv, config.env.clone(), self.config.command_timeout)
                .await
            {
                Ok(result) if result.success() => {
                    debug!("Init script {} finished for environment {}", index, environment.id)
                }
                Ok(result) => warn!(
                    "Init script {} exited with {} for environment {}: {}",
                    index,
                    result.exit_code,
                    environment.id,
                    result.stderr.trim()
                ),
                Err(e) => warn!(
                    "Init script {} failed for environment {}: {}",
                    index, environment.id, e
                ),
            }
        }

        Ok(Provisioned {
            handle: BackendHandle::Container {
                container_id,
                network_id,
                volume_ids,
                extra_containers: Vec::new(),
                compose_projects: Vec::new(),
                built_images: Vec::new(),
            },
            endpoints,
        })
    }

    async fn rollback(&self, environment_id: &str, undo: Vec<Allocation>) {
        for allocation in undo.into_iter().rev() {
            let outcome = match &allocation {
                Allocation::Container(id) => self.engine.remove_container(id).await,
                Allocation::Volume(name) => self.engine.remove_volume(name).await,
                Allocation::Network(id) => self.engine.remove_network(id).await,
            };
            if let Err(e) = outcome {
                warn!("Rollback step failed for environment {}: {}", environment_id, e);
            }
        }
    }

    async fn teardown(&self, environment: &Environment) -> Result<()> {
        let Some(BackendHandle::Container {
            container_id,
            network_id,
            volume_ids,
            extra_containers,
            compose_projects,
            built_images,
        }) = &environment.handle
        else {
            return Ok(());
        };

        for project in compose_projects {
            run_checked(
                self.runner.as_ref(),
                self.compose(project, network_id)
                    .args(["down", "--volumes", "--remove-orphans"])
                    .timeout(self.config.command_timeout),
            )
            .await?;
        }
        for id in extra_containers.iter().chain(std::iter::once(container_id)) {
            self.engine.remove_container(id).await?;
        }
        for image in built_images {
            self.engine.remove_image(image).await?;
        }
        for volume in volume_ids {
            self.engine.remove_volume(volume).await?;
        }
        self.engine.remove_network(network_id).await?;
        Ok(())
    }

    fn compose(&self, project: &str, network_id: &str) -> Invocation {
        let inv = Invocation::new(&self.config.docker_bin)
            .args(["compose", "--project-name", project])
            .env("WORKSHOP_NETWORK", network_id);
        match &self.config.docker_socket {
            Some(socket) => inv.env("DOCKER_HOST", format!("unix://{}", socket)),
            None => inv,
        }
    }

    /// Ready environment plus its container handle parts
    fn ready_handle(&self, id: &str) -> Result<(Environment, String, String)> {
        let environment = self.table.require_ready(id)?;
        match &environment.handle {
            Some(BackendHandle::Container {
                container_id,
                network_id,
                ..
            }) => {
                let (container_id, network_id) = (container_id.clone(), network_id.clone());
                Ok((environment, container_id, network_id))
            }
            _ => Err(Error::Internal(format!(
                "Environment {} has no container handle",
                id
            ))),
        }
    }

    fn timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.command_timeout)
    }

    async fn endpoint_reachable(&self, environment: &Environment, target: &str, timeout: Duration) -> ProbeOutcome {
        let address = if target.contains(':') {
            Some(target.to_string())
        } else {
            environment
                .endpoints
                .get(target)
                .map(|host| host.replace("0.0.0.0", "127.0.0.1"))
        };

        let Some(address) = address else {
            return ProbeOutcome {
                found: false,
                actual: Value::Bool(false),
                detail: format!("Port {} is not published", target),
            };
        };

        let reachable = matches!(
            tokio::time::timeout(timeout, TcpStream::connect(&address)).await,
            Ok(Ok(_))
        );
        ProbeOutcome {
            found: reachable,
            actual: Value::Bool(reachable),
            detail: if reachable {
                format!("{} accepted a connection", address)
            } else {
                format!("{} did not accept a connection", address)
            },
        }
    }
}

#[async_trait]
impl EnvironmentProvider for ContainerProvider {
    fn backend(&self) -> BackendType {
        BackendType::Container
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn create_environment(&self, request: CreateEnvironmentRequest) -> Result<Environment> {
        let id = Uuid::new_v4().to_string();
        let environment = Environment::new(
            id.clone(),
            request.session_id.clone(),
            BackendType::Container,
            &request.config,
        );
        self.table.insert(environment.clone());
        info!(
            "Creating container environment {} for session {} (template {}, user {})",
            id, request.session_id, request.template_id, request.user_id
        );

        let mut undo = Vec::new();
        match self.provision(&environment, &request, &mut undo).await {
            Ok(provisioned) => {
                let ready = self.table.update(&id, |env| {
                    env.handle = Some(provisioned.handle);
                    env.endpoints = provisioned.endpoints;
                    env.transition_to(EnvironmentStatus::Ready);
                })?;
                info!("Container environment {} is ready", id);
                Ok(ready)
            }
            Err(e) => {
                error!("Failed to create container environment {}: {}", id, e);
                self.rollback(&id, undo).await;
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
            debug!("Container environment {} already gone", id);
            return Ok(());
        };

        info!("Destroying container environment {}", id);
        match self.teardown(&environment).await {
            Ok(()) => {
                self.table.remove(id);
                info!("Container environment {} destroyed", id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to destroy container environment {}: {}", id, e);
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
        let (_, container_id, _) = self.ready_handle(id)?;
        if argv.is_empty() {
            return Err(Error::InvalidRequest("Empty command".to_string()));
        }

        let result = self
            .engine
            .exec(&container_id, argv, options.env, self.timeout(options.timeout_ms))
            .await;
        self.table.touch(id);
        result
    }

    async fn get_logs(
        &self,
        id: &str,
        target: Option<&str>,
        options: &LogOptions,
    ) -> Result<LogOutput> {
        let (environment, container_id, network_id) = self.ready_handle(id)?;
        self.table.touch(id);

        let (extra_containers, compose_projects) = match &environment.handle {
            Some(BackendHandle::Container {
                extra_containers,
                compose_projects,
                ..
            }) => (extra_containers.clone(), compose_projects.clone()),
            _ => (Vec::new(), Vec::new()),
        };

        let container = match target {
            None => container_id,
            Some(t) if t == container_id || t == "main" => container_id,
            Some(t) if compose_projects.iter().any(|p| p == t) => {
                let mut inv = self.compose(t, &network_id).arg("logs").arg("--no-color");
                if let Some(tail) = options.tail {
                    inv = inv.arg(format!("--tail={}", tail));
                }
                if let Some(since) = &options.since {
                    inv = inv.arg(format!("--since={}", since));
                }
                if options.follow {
                    let stream = self.runner.stream(inv.arg("--follow")).await?;
                    return Ok(LogOutput::Stream(stream));
                }
                let result = run_checked(
                    self.runner.as_ref(),
                    inv.timeout(self.config.command_timeout),
                )
                .await?;
                return Ok(LogOutput::Text(result.stdout));
            }
            Some(t) => extra_containers
                .into_iter()
                .find(|c| c.starts_with(t))
                .ok_or_else(|| Error::InvalidRequest(format!("Unknown log target: {}", t)))?,
        };

        if options.follow {
            let stream = self.engine.follow_logs(&container, options).await?;
            return Ok(LogOutput::Stream(stream));
        }
        Ok(LogOutput::Text(self.engine.logs(&container, options).await?))
    }

    async fn apply_configuration(
        &self,
        id: &str,
        payload: &str,
        kind: ConfigurationKind,
    ) -> Result<()> {
        self.check_configuration_kind(kind)?;
        let (environment, _, network_id) = self.ready_handle(id)?;
        let short = short_id(id);
        let sequence = match &environment.handle {
            Some(BackendHandle::Container {
                built_images,
                compose_projects,
                ..
            }) => built_images.len() + compose_projects.len() + 1,
            _ => 1,
        };
        let label = format!("workshop-{}-{}", short, sequence);

        match kind {
            ConfigurationKind::BuildSpec => {
                self.engine.build_image(&label, payload).await?;
                self.table.update(id, |env| {
                    if let Some(BackendHandle::Container { built_images, .. }) =
                        env.handle.as_mut()
                    {
                        built_images.push(label.clone());
                    }
                })?;
                let container_id = self
                    .engine
                    .create_container(CreateContainerOpts {
                        name: label.clone(),
                        image: label.clone(),
                        labels: HashMap::from([(
                            "workshop.environment.id".to_string(),
                            id.to_string(),
                        )]),
                        network: Some(network_id),
                        ..Default::default()
                    })
                    .await?;
                // Track before starting so destroy reclaims it either way
                self.table.update(id, |env| {
                    if let Some(BackendHandle::Container {
                        extra_containers, ..
                    }) = env.handle.as_mut()
                    {
                        extra_containers.push(container_id.clone());
                    }
                })?;
                self.engine.start_container(&container_id).await?;
                info!("Launched built image {} in environment {}", label, id);
            }
            ConfigurationKind::ComposeSpec => {
                self.table.update(id, |env| {
                    if let Some(BackendHandle::Container {
                        compose_projects, ..
                    }) = env.handle.as_mut()
                    {
                        compose_projects.push(label.clone());
                    }
                })?;
                run_checked(
                    self.runner.as_ref(),
                    self.compose(&label, &network_id)
                        .args(["-f", "-", "up", "--detach"])
                        .stdin(payload)
                        .timeout(self.config.command_timeout),
                )
                .await?;
                info!("Started compose project {} in environment {}", label, id);
            }
            ConfigurationKind::Manifest => {
                return Err(Error::UnsupportedConfiguration {
                    backend: self.backend().to_string(),
                    kind: kind.as_str().to_string(),
                })
            }
        }

        self.table.touch(id);
        Ok(())
    }

    async fn get_environment_status(&self, id: &str) -> Result<StatusSnapshot> {
        let environment = self
            .table
            .get(id)
            .ok_or_else(|| Error::EnvironmentNotFound(id.to_string()))?;

        let Some(BackendHandle::Container {
            container_id,
            network_id,
            ..
        }) = environment.handle.clone().filter(|_| environment.is_ready())
        else {
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
        };

        let inspection = self.engine.inspect_container(&container_id).await?;
        let attached = self
            .engine
            .network_containers(&network_id)
            .await?
            .iter()
            .any(|c| c == &container_id);

        let mut checks = vec![HealthCheck::new(
            "container",
            inspection.running,
            if inspection.running { "running" } else { "stopped" },
        )];
        if let Some(health) = &inspection.health {
            checks.push(HealthCheck::new(
                "healthcheck",
                health == "healthy",
                health.clone(),
            ));
        }
        checks.push(HealthCheck::new(
            "network",
            attached,
            if attached { "attached" } else { "detached" },
        ));

        let health = if !inspection.running {
            Health::Unhealthy
        } else if checks.iter().all(|c| c.passed) {
            Health::Healthy
        } else {
            Health::Degraded
        };

        Ok(StatusSnapshot {
            environment_id: environment.id,
            status: environment.status,
            health,
            checks,
            endpoints: environment.endpoints,
            observed_at: Utc::now(),
        })
    }

    async fn probe(&self, id: &str, probe: &Probe) -> Result<ProbeOutcome> {
        let (environment, container_id, _) = self.ready_handle(id)?;
        let timeout = self.timeout(probe.timeout_ms);
        let target = probe.target.trim();
        self.table.touch(id);

        match probe.kind {
            ProbeKind::ResourceExists => {
                let argv = vec!["test".to_string(), "-e".to_string(), target.to_string()];
                let result = self
                    .engine
                    .exec(&container_id, argv, HashMap::new(), timeout)
                    .await?;
                let found = result.success();
                Ok(ProbeOutcome {
                    found,
                    actual: Value::Bool(found),
                    detail: if found {
                        format!("{} exists", target)
                    } else {
                        format!("{} does not exist", target)
                    },
                })
            }
            ProbeKind::ResourceStatus => {
                let subject = if target.is_empty() || target == "main" {
                    container_id
                } else {
                    target.to_string()
                };
                let inspection = self.engine.inspect_container(&subject).await?;
                Ok(ProbeOutcome {
                    found: true,
                    actual: json!({
                        "running": inspection.running,
                        "health": inspection.health,
                        "ports": inspection.ports,
                    }),
                    detail: format!("Inspected {}", subject),
                })
            }
            ProbeKind::EndpointReachable => {
                Ok(self.endpoint_reachable(&environment, target, timeout).await)
            }
            ProbeKind::FileContent => {
                let argv = vec!["cat".to_string(), target.to_string()];
                let result = self
                    .engine
                    .exec(&container_id, argv, HashMap::new(), timeout)
                    .await?;
                Ok(file_outcome(target, result))
            }
            ProbeKind::Custom => {
                let argv = vec!["sh".to_string(), "-c".to_string(), target.to_string()];
                let result = self
                    .engine
                    .exec(&container_id, argv, HashMap::new(), timeout)
                    .await?;
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

    fn command_argv(&self, command: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), command.to_string()]
    }

    fn supported_configurations(&self) -> &'static [ConfigurationKind] {
        SUPPORTED
    }
}

fn short_id(id: &str) -> &str {
    &id[..12.min(id.len())]
}
