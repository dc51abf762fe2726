//! Backend cluster registry records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connectivity status of a registered cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Connected,
    Disconnected,
    Error,
    Testing,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Connected => "connected",
            ClusterStatus::Disconnected => "disconnected",
            ClusterStatus::Error => "error",
            ClusterStatus::Testing => "testing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ClusterStatus::Connected),
            "disconnected" => Some(ClusterStatus::Disconnected),
            "error" => Some(ClusterStatus::Error),
            "testing" => Some(ClusterStatus::Testing),
            _ => None,
        }
    }
}

/// Scoped credential for reaching a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ClusterCredential {
    /// Full kubeconfig document
    Kubeconfig(String),
    /// Bearer token used against `endpoint`
    Token(TokenCredential),
}

/// Bearer token plus how the endpoint's certificate is trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredential {
    pub token: String,
    /// PEM bundle for the API server; system roots when unset
    #[serde(default)]
    pub certificate_authority: Option<String>,
    /// Verification is only skipped when a record opts in
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

impl TokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            certificate_authority: None,
            insecure_skip_tls_verify: false,
        }
    }
}

/// Resource totals reported by the last successful health check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCapacity {
    pub version: Option<String>,
    pub node_count: u32,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// Registered backend cluster
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub credential: ClusterCredential,
    pub namespace: String,
    pub is_default: bool,
    pub status: ClusterStatus,
    pub status_message: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub capacity: ClusterCapacity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for registering a cluster
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterParams {
    pub name: String,
    pub endpoint: String,
    pub credential: ClusterCredential,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub is_default: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Partial update of a cluster record
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClusterParams {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub credential: Option<ClusterCredential>,
    pub namespace: Option<String>,
    pub is_default: Option<bool>,
}

impl ClusterRecord {
    pub fn new(id: String, params: CreateClusterParams) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: params.name,
            endpoint: params.endpoint,
            credential: params.credential,
            namespace: params.namespace,
            is_default: params.is_default,
            status: ClusterStatus::Disconnected,
            status_message: None,
            last_health_check: None,
            capacity: ClusterCapacity::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, params: UpdateClusterParams) {
        if let Some(name) = params.name {
            self.name = name;
        }
        if let Some(endpoint) = params.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(credential) = params.credential {
            self.credential = credential;
        }
        if let Some(namespace) = params.namespace {
            self.namespace = namespace;
        }
        if let Some(is_default) = params.is_default {
            self.is_default = is_default;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_available(&self) -> bool {
        self.status == ClusterStatus::Connected
    }
}

/// Per-cluster usage line in the aggregated metrics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUsage {
    pub cluster_id: String,
    pub name: String,
    pub status: ClusterStatus,
    pub active_environments: usize,
    pub capacity: ClusterCapacity,
}

/// Registry-wide aggregated metrics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetrics {
    pub total_clusters: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub errored: usize,
    pub total_nodes: u32,
    pub total_cpu_millis: u64,
    pub total_memory_bytes: u64,
    pub active_environments: usize,
    pub clusters: Vec<ClusterUsage>,
}
