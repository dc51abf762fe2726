//! Sandbox environment domain model

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::expiry_after;
use super::template::{NetworkingSpec, ProbeKind, ResourceRequest, VolumeSpec};
use crate::error::Result;

/// Backend family implementing the environment contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// One virtual cluster per sandbox inside a parent cluster
    Cluster,
    /// Network + container + volumes on a container engine
    Container,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Cluster => "cluster",
            BackendType::Container => "container",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cluster" | "kubernetes" | "vcluster" => Some(BackendType::Cluster),
            "container" | "docker" => Some(BackendType::Container),
            _ => None,
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Resources are being allocated
    Creating,
    /// Reachable for commands
    Ready,
    /// Creation or runtime failure
    Error,
    /// Teardown in progress
    Destroying,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Creating => "creating",
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Error => "error",
            EnvironmentStatus::Destroying => "destroying",
        }
    }
}

/// Backend-specific handle to the allocated resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendHandle {
    Cluster {
        /// Registered cluster hosting the virtual cluster, if any
        cluster_id: Option<String>,
        namespace: String,
        vcluster_name: String,
        /// Scoped credential for the virtual cluster
        #[serde(skip_serializing, default)]
        kubeconfig_path: String,
    },
    Container {
        container_id: String,
        network_id: String,
        volume_ids: Vec<String>,
        /// Containers launched later from build specs
        extra_containers: Vec<String>,
        /// Compose projects launched on the sandbox network
        compose_projects: Vec<String>,
        /// Image tags built from build specs
        #[serde(default)]
        built_images: Vec<String>,
    },
}

/// Live sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub session_id: String,
    pub backend: BackendType,
    pub status: EnvironmentStatus,
    /// Resources actually granted
    pub resources: ResourceRequest,
    pub endpoints: HashMap<String, String>,
    pub handle: Option<BackendHandle>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl Environment {
    pub fn new(id: String, session_id: String, backend: BackendType, config: &EnvironmentConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            backend,
            status: EnvironmentStatus::Creating,
            resources: config.resources.clone(),
            endpoints: HashMap::new(),
            handle: None,
            created_at: now,
            expires_at: expiry_after(now, config.duration_minutes),
            last_activity: now,
            error_message: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == EnvironmentStatus::Ready
    }

    /// Transition to a new status
    pub fn transition_to(&mut self, new_status: EnvironmentStatus) -> bool {
        let valid_transition = matches!(
            (self.status, new_status),
            (EnvironmentStatus::Creating, EnvironmentStatus::Ready)
                | (EnvironmentStatus::Creating, EnvironmentStatus::Error)
                | (EnvironmentStatus::Creating, EnvironmentStatus::Destroying)
                | (EnvironmentStatus::Ready, EnvironmentStatus::Error)
                | (EnvironmentStatus::Ready, EnvironmentStatus::Destroying)
                | (EnvironmentStatus::Error, EnvironmentStatus::Destroying)
        );

        if valid_transition {
            self.status = new_status;
        }

        valid_transition
    }
}

/// Parameters for creating an environment
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub resources: ResourceRequest,
    pub networking: NetworkingSpec,
    pub duration_minutes: u64,
    pub env: HashMap<String, String>,
    pub init_scripts: Vec<String>,
    pub volumes: Vec<VolumeSpec>,
    /// Template kind, used for image selection
    pub kind: Option<String>,
    pub privileged: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            resources: ResourceRequest::default(),
            networking: NetworkingSpec::default(),
            duration_minutes: 60,
            env: HashMap::new(),
            init_scripts: Vec::new(),
            volumes: Vec::new(),
            kind: None,
            privileged: false,
        }
    }
}

/// Command result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for executing a command
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout_ms: Option<u64>,
    pub env: HashMap<String, String>,
}

impl ExecOptions {
    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            timeout_ms: Some(timeout_ms),
            ..Default::default()
        }
    }
}

/// Options for retrieving logs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogOptions {
    #[serde(default)]
    pub follow: bool,
    pub tail: Option<usize>,
    /// Relative duration understood by the backend, e.g. "10m"
    pub since: Option<String>,
}

/// Live log stream; dropping it releases the underlying channel
pub type LogStream = BoxStream<'static, Result<String>>;

/// Buffered text or a live stream when follow was requested
pub enum LogOutput {
    Text(String),
    Stream(LogStream),
}

impl fmt::Debug for LogOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogOutput::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            LogOutput::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Declarative configuration payload kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigurationKind {
    /// Cluster manifest text
    Manifest,
    /// Image build instructions
    BuildSpec,
    /// Multi-service compose file
    ComposeSpec,
}

impl ConfigurationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationKind::Manifest => "manifest",
            ConfigurationKind::BuildSpec => "build-spec",
            ConfigurationKind::ComposeSpec => "compose-spec",
        }
    }
}

/// Derived environment health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl HealthCheck {
    pub fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        }
    }
}

/// Point-in-time environment status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub environment_id: String,
    pub status: EnvironmentStatus,
    pub health: Health,
    pub checks: Vec<HealthCheck>,
    pub endpoints: HashMap<String, String>,
    pub observed_at: DateTime<Utc>,
}

/// Live probe request issued by the validation interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub kind: ProbeKind,
    pub target: String,
    pub timeout_ms: Option<u64>,
}

/// Raw probe observation, compared against expectations by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    /// Whether the probed thing exists / responded
    pub found: bool,
    /// Observed value (parsed JSON when the backend returns it, else text)
    pub actual: Value,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_expiry_fixed_at_creation() {
        let config = EnvironmentConfig {
            duration_minutes: 60,
            ..Default::default()
        };
        let env = Environment::new("e1".into(), "s1".into(), BackendType::Container, &config);
        assert_eq!(env.status, EnvironmentStatus::Creating);
        assert_eq!(env.expires_at - env.created_at, Duration::minutes(60));
    }

    #[test]
    fn test_status_transitions() {
        let config = EnvironmentConfig::default();
        let mut env = Environment::new("e1".into(), "s1".into(), BackendType::Cluster, &config);
        assert!(!env.transition_to(EnvironmentStatus::Creating));
        assert!(env.transition_to(EnvironmentStatus::Ready));
        assert!(env.is_ready());
        assert!(!env.transition_to(EnvironmentStatus::Creating));
        assert!(env.transition_to(EnvironmentStatus::Destroying));
        assert!(!env.transition_to(EnvironmentStatus::Ready));
    }

    #[test]
    fn test_backend_type_parsing() {
        assert_eq!(BackendType::from_str("docker"), Some(BackendType::Container));
        assert_eq!(BackendType::from_str("vcluster"), Some(BackendType::Cluster));
        assert_eq!(BackendType::from_str("nomad"), None);
        assert_eq!(BackendType::Cluster.to_string(), "cluster");
    }
}
