//! Server configuration

use std::time::Duration;

use serde::Deserialize;

use crate::domain::environment::BackendType;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Database URL (SQLite)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Docker socket path. Local defaults are used when unset.
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Cluster-control CLI binary
    #[serde(default = "default_kubectl_bin")]
    pub kubectl_bin: String,

    /// Virtual-cluster CLI binary
    #[serde(default = "default_vcluster_bin")]
    pub vcluster_bin: String,

    /// Container CLI binary (used for compose stacks)
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Kubeconfig of the parent cluster used when no registered cluster is available
    #[serde(default)]
    pub parent_kubeconfig: Option<String>,

    /// Scratch directory for generated kubeconfig files
    #[serde(default = "default_kubeconfig_dir")]
    pub kubeconfig_dir: String,

    /// Backend used when neither the request nor the template names one
    #[serde(default = "default_backend")]
    pub default_backend: BackendType,

    /// Default session duration in minutes
    #[serde(default = "default_session_minutes")]
    pub default_session_minutes: u64,

    /// Expired session sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Cluster health check interval in seconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Upper bound on waiting for a virtual cluster to become ready, in seconds
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Interval between readiness polls, in milliseconds
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_ms: u64,

    /// Delay after the control plane reports running, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Default timeout for commands run inside a sandbox, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Whether the container backend may honour template-declared privileged mode
    #[serde(default)]
    pub allow_privileged: bool,

    /// Namespaces seeded into every virtual cluster
    #[serde(default = "default_seed_namespaces")]
    pub seed_namespaces: Vec<String>,

    /// Image used for templates without a known kind
    #[serde(default = "default_container_image")]
    pub default_container_image: String,

    /// Directory of template JSON files loaded at startup
    #[serde(default)]
    pub templates_dir: Option<String>,

    /// Log output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite:data/workshop.db?mode=rwc".to_string()
}

fn default_kubectl_bin() -> String {
    "kubectl".to_string()
}

fn default_vcluster_bin() -> String {
    "vcluster".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_kubeconfig_dir() -> String {
    "data/kubeconfigs".to_string()
}

fn default_backend() -> BackendType {
    BackendType::Container
}

fn default_session_minutes() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}

fn default_health_interval() -> u64 {
    300 // 5 minutes
}

fn default_readiness_timeout() -> u64 {
    300
}

fn default_readiness_poll() -> u64 {
    5000
}

fn default_settle_delay() -> u64 {
    10_000
}

fn default_command_timeout() -> u64 {
    30_000
}

fn default_seed_namespaces() -> Vec<String> {
    vec!["workshop".to_string()]
}

fn default_container_image() -> String {
    "alpine:3.20".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::default();

        if let Ok(val) = std::env::var("WORKSHOP_HTTP_HOST") {
            config.http_host = val;
        }
        if let Ok(val) = std::env::var("WORKSHOP_HTTP_PORT") {
            config.http_port = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_DATABASE_URL") {
            config.database_url = val;
        }
        if let Ok(val) = std::env::var("WORKSHOP_DOCKER_SOCKET") {
            config.docker_socket = Some(val);
        }
        if let Ok(val) = std::env::var("WORKSHOP_KUBECTL_BIN") {
            config.kubectl_bin = val;
        }
        if let Ok(val) = std::env::var("WORKSHOP_VCLUSTER_BIN") {
            config.vcluster_bin = val;
        }
        if let Ok(val) = std::env::var("WORKSHOP_DOCKER_BIN") {
            config.docker_bin = val;
        }
        if let Ok(val) = std::env::var("WORKSHOP_PARENT_KUBECONFIG") {
            config.parent_kubeconfig = Some(val);
        }
        if let Ok(val) = std::env::var("WORKSHOP_KUBECONFIG_DIR") {
            config.kubeconfig_dir = val;
        }
        if let Ok(val) = std::env::var("WORKSHOP_DEFAULT_BACKEND") {
            config.default_backend = BackendType::from_str(&val)
                .ok_or_else(|| anyhow::anyhow!("Unknown backend type: {}", val))?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_DEFAULT_SESSION_MINUTES") {
            config.default_session_minutes = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_HEALTH_CHECK_INTERVAL_SECS") {
            config.health_check_interval_secs = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_READINESS_TIMEOUT_SECS") {
            config.readiness_timeout_secs = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_READINESS_POLL_MS") {
            config.readiness_poll_ms = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_SETTLE_DELAY_MS") {
            config.settle_delay_ms = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_COMMAND_TIMEOUT_MS") {
            config.command_timeout_ms = val.parse()?;
        }
        if let Ok(val) = std::env::var("WORKSHOP_ALLOW_PRIVILEGED") {
            config.allow_privileged = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("WORKSHOP_SEED_NAMESPACES") {
            // Comma-separated list
            config.seed_namespaces = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("WORKSHOP_DEFAULT_CONTAINER_IMAGE") {
            config.default_container_image = val;
        }
        if let Ok(val) = std::env::var("WORKSHOP_TEMPLATES_DIR") {
            config.templates_dir = Some(val);
        }
        if let Ok(val) = std::env::var("WORKSHOP_LOG_FORMAT") {
            config.log_format = val;
        }

        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            database_url: default_database_url(),
            docker_socket: None,
            kubectl_bin: default_kubectl_bin(),
            vcluster_bin: default_vcluster_bin(),
            docker_bin: default_docker_bin(),
            parent_kubeconfig: None,
            kubeconfig_dir: default_kubeconfig_dir(),
            default_backend: default_backend(),
            default_session_minutes: default_session_minutes(),
            sweep_interval_secs: default_sweep_interval(),
            health_check_interval_secs: default_health_interval(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_poll_ms: default_readiness_poll(),
            settle_delay_ms: default_settle_delay(),
            command_timeout_ms: default_command_timeout(),
            allow_privileged: false,
            seed_namespaces: default_seed_namespaces(),
            default_container_image: default_container_image(),
            templates_dir: None,
            log_format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_intervals() {
        let config = Config::default();
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.health_check_interval(), Duration::from_secs(300));
        assert_eq!(config.readiness_timeout_secs, 300);
        assert_eq!(config.default_backend, BackendType::Container);
        assert!(!config.allow_privileged);
    }
}
