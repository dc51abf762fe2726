//! In-process fakes shared by unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::domain::environment::{
    BackendType, CommandResult, ConfigurationKind, Environment, EnvironmentStatus, ExecOptions,
    Health, LogOptions, LogOutput, LogStream, Probe, ProbeOutcome, StatusSnapshot,
};
use crate::domain::template::WorkshopTemplate;
use crate::error::{Error, Result};
use crate::infra::docker::{ContainerEngine, ContainerInspection, CreateContainerOpts};
use crate::infra::sqlite::SqliteStore;
use crate::provider::{CreateEnvironmentRequest, EnvironmentProvider, EnvironmentTable};

pub fn ok_result(stdout: &str) -> CommandResult {
    CommandResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
        duration_ms: 1,
    }
}

/// Migrated store on a private in-memory database
pub async fn memory_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    SqliteStore::new(pool)
}

pub fn template(value: Value) -> WorkshopTemplate {
    serde_json::from_value(value).expect("valid template")
}

#[derive(Clone)]
struct FakeContainer {
    opts: CreateContainerOpts,
    running: bool,
}

#[derive(Default)]
struct EngineState {
    networks: HashMap<String, String>,
    volumes: Vec<String>,
    containers: HashMap<String, FakeContainer>,
    created: Vec<CreateContainerOpts>,
    images: Vec<String>,
    responses: HashMap<String, CommandResult>,
    fail_start: bool,
}

/// Container engine that keeps every resource in memory
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    /// Script the result of an exec; `sh -c` commands are keyed by their script
    pub fn respond(&self, command: &str, stdout: &str, exit_code: i32) {
        self.state.lock().unwrap().responses.insert(
            command.to_string(),
            CommandResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
                duration_ms: 1,
            },
        );
    }

    pub fn created_containers(&self) -> Vec<CreateContainerOpts> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    pub fn built_images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.clone()
    }

    pub fn stop_all(&self) {
        for container in self.state.lock().unwrap().containers.values_mut() {
            container.running = false;
        }
    }
}

fn exec_key(argv: &[String]) -> String {
    match argv {
        [sh, flag, script] if sh == "sh" && flag == "-c" => script.clone(),
        _ => argv.join(" "),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_network(&self, name: &str, _labels: HashMap<String, String>) -> Result<String> {
        let id = format!("net-{}", Uuid::new_v4());
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.state.lock().unwrap().networks.remove(id);
        Ok(())
    }

    async fn network_containers(&self, id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.opts.network.as_deref() == Some(id))
            .map(|(cid, _)| cid.clone())
            .collect())
    }

    async fn create_volume(&self, name: &str, _labels: HashMap<String, String>) -> Result<String> {
        self.state.lock().unwrap().volumes.push(name.to_string());
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().volumes.retain(|v| v != name);
        Ok(())
    }

    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String> {
        let id = format!("ctr-{}", Uuid::new_v4());
        let mut state = self.state.lock().unwrap();
        state.created.push(opts.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                opts,
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(Error::DockerError(format!("Failed to start container {}", id)));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::DockerError(format!("No such container: {}", id)))?;
        container.running = true;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.state.lock().unwrap().containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspection> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| Error::DockerError(format!("No such container: {}", id)))?;
        let ports = container
            .opts
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| (format!("{}/tcp", port), format!("0.0.0.0:{}", 49152 + i)))
            .collect();
        Ok(ContainerInspection {
            running: container.running,
            health: None,
            ports,
        })
    }

    async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        _env: HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<CommandResult> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(Error::DockerError(format!("No such container: {}", id)));
        }
        Ok(state
            .responses
            .get(&exec_key(&argv))
            .cloned()
            .unwrap_or_else(|| ok_result("")))
    }

    async fn logs(&self, id: &str, _options: &LogOptions) -> Result<String> {
        Ok(format!("started {}\nlistening\n", id))
    }

    async fn follow_logs(&self, id: &str, _options: &LogOptions) -> Result<LogStream> {
        let lines = vec![Ok(format!("started {}", id)), Ok("listening".to_string())];
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn build_image(&self, tag: &str, _dockerfile: &str) -> Result<()> {
        self.state.lock().unwrap().images.push(tag.to_string());
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.state.lock().unwrap().images.retain(|i| i != tag);
        Ok(())
    }
}

/// Provider whose sandboxes are plain table entries
///
/// Probe and command results are scripted by target / command line.
pub struct FakeProvider {
    backend: BackendType,
    table: EnvironmentTable,
    probes: Mutex<HashMap<String, ProbeOutcome>>,
    commands: Mutex<HashMap<String, CommandResult>>,
    applied: Mutex<Vec<(ConfigurationKind, String)>>,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    fail_apply: AtomicBool,
    fail_status: AtomicBool,
    pub creates: AtomicUsize,
    pub destroys: AtomicUsize,
}

impl FakeProvider {
    pub fn new(backend: BackendType) -> Arc<Self> {
        Arc::new(Self {
            backend,
            table: EnvironmentTable::new(),
            probes: Mutex::new(HashMap::new()),
            commands: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        })
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn set_probe(&self, target: &str, found: bool, actual: Value) {
        self.probes.lock().unwrap().insert(
            target.to_string(),
            ProbeOutcome {
                found,
                actual,
                detail: format!("probed {}", target),
            },
        );
    }

    pub fn set_command(&self, command: &str, stdout: &str, exit_code: i32) {
        self.commands.lock().unwrap().insert(
            command.to_string(),
            CommandResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
                duration_ms: 1,
            },
        );
    }

    pub fn applied(&self) -> Vec<(ConfigurationKind, String)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl EnvironmentProvider for FakeProvider {
    fn backend(&self) -> BackendType {
        self.backend
    }

    fn name(&self) -> &str {
        "fake"
    }

    async fn create_environment(&self, request: CreateEnvironmentRequest) -> Result<Environment> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::ProvisioningFailed("quota exceeded".to_string()));
        }
        let mut environment = Environment::new(
            Uuid::new_v4().to_string(),
            request.session_id,
            self.backend,
            &request.config,
        );
        environment.transition_to(EnvironmentStatus::Ready);
        self.table.insert(environment.clone());
        Ok(environment)
    }

    async fn destroy_environment(&self, id: &str) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::ProcessError("teardown refused".to_string()));
        }
        if self.table.remove(id).is_some() {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        id: &str,
        argv: Vec<String>,
        _options: ExecOptions,
    ) -> Result<CommandResult> {
        self.table.require_ready(id)?;
        let line = argv.join(" ");
        Ok(self
            .commands
            .lock()
            .unwrap()
            .get(&line)
            .cloned()
            .unwrap_or_else(|| ok_result("")))
    }

    async fn get_logs(
        &self,
        id: &str,
        _target: Option<&str>,
        options: &LogOptions,
    ) -> Result<LogOutput> {
        self.table.require_ready(id)?;
        if options.follow {
            let head = futures::stream::iter(vec![Ok("booted".to_string())]);
            return Ok(LogOutput::Stream(head.chain(futures::stream::pending()).boxed()));
        }
        Ok(LogOutput::Text("booted\n".to_string()))
    }

    async fn apply_configuration(
        &self,
        id: &str,
        payload: &str,
        kind: ConfigurationKind,
    ) -> Result<()> {
        self.table.require_ready(id)?;
        self.check_configuration_kind(kind)?;
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(Error::CommandFailed {
                exit_code: 1,
                stderr: "invalid payload".to_string(),
            });
        }
        self.applied
            .lock()
            .unwrap()
            .push((kind, payload.to_string()));
        Ok(())
    }

    async fn get_environment_status(&self, id: &str) -> Result<StatusSnapshot> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Error::ProcessError("backend unreachable".to_string()));
        }
        let environment = self
            .table
            .get(id)
            .ok_or_else(|| Error::EnvironmentNotFound(id.to_string()))?;
        Ok(StatusSnapshot {
            environment_id: environment.id,
            status: environment.status,
            health: Health::Healthy,
            checks: Vec::new(),
            endpoints: environment.endpoints,
            observed_at: Utc::now(),
        })
    }

    async fn probe(&self, id: &str, probe: &Probe) -> Result<ProbeOutcome> {
        self.table.require_ready(id)?;
        self.probes
            .lock()
            .unwrap()
            .get(&probe.target)
            .cloned()
            .ok_or_else(|| Error::ProcessError(format!("probe {} timed out", probe.target)))
    }

    fn get_environment(&self, id: &str) -> Option<Environment> {
        self.table.get(id)
    }

    fn environment_ids(&self) -> Vec<String> {
        self.table.ids()
    }

    fn supported_configurations(&self) -> &'static [ConfigurationKind] {
        &[
            ConfigurationKind::Manifest,
            ConfigurationKind::BuildSpec,
            ConfigurationKind::ComposeSpec,
        ]
    }
}
