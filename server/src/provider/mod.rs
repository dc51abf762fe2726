//! Sandbox provider contract
//!
//! Every backend implements [`EnvironmentProvider`]. Shared bookkeeping for
//! the active-environment table lives in [`EnvironmentTable`].

pub mod cluster;
pub mod container;
pub mod factory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use crate::domain::environment::{
    BackendType, CommandResult, ConfigurationKind, Environment, EnvironmentConfig,
    EnvironmentStatus, ExecOptions, LogOptions, LogOutput, Probe, ProbeOutcome, StatusSnapshot,
};
use crate::error::{Error, Result};

pub use factory::ProviderFactory;

/// Everything a provider needs to allocate one sandbox
#[derive(Debug, Clone)]
pub struct CreateEnvironmentRequest {
    pub session_id: String,
    pub template_id: String,
    pub user_id: String,
    pub config: EnvironmentConfig,
}

/// Lifecycle contract shared by all backends
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    fn backend(&self) -> BackendType;

    /// Logical name this instance was registered under
    fn name(&self) -> &str;

    /// Returns only once the sandbox is reachable for commands. On failure
    /// everything allocated so far has been released.
    async fn create_environment(&self, request: CreateEnvironmentRequest) -> Result<Environment>;

    /// Unknown or already destroyed ids succeed
    async fn destroy_environment(&self, id: &str) -> Result<()>;

    async fn execute_command(
        &self,
        id: &str,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> Result<CommandResult>;

    /// Buffered text, or a live stream when `options.follow` is set
    async fn get_logs(&self, id: &str, target: Option<&str>, options: &LogOptions)
        -> Result<LogOutput>;

    async fn apply_configuration(
        &self,
        id: &str,
        payload: &str,
        kind: ConfigurationKind,
    ) -> Result<()>;

    async fn get_environment_status(&self, id: &str) -> Result<StatusSnapshot>;

    /// Observe live sandbox state for a validation check
    async fn probe(&self, id: &str, probe: &Probe) -> Result<ProbeOutcome>;

    fn get_environment(&self, id: &str) -> Option<Environment>;

    /// Ids of every environment this instance still tracks
    fn environment_ids(&self) -> Vec<String>;

    /// Turn a participant's command line into an argv for this backend
    fn command_argv(&self, command: &str) -> Vec<String> {
        split_command(command)
    }

    /// Configuration kinds `apply_configuration` accepts
    fn supported_configurations(&self) -> &'static [ConfigurationKind];

    /// Reject configuration kinds this backend cannot apply
    fn check_configuration_kind(&self, kind: ConfigurationKind) -> Result<()> {
        if self.supported_configurations().contains(&kind) {
            Ok(())
        } else {
            Err(Error::UnsupportedConfiguration {
                backend: self.backend().to_string(),
                kind: kind.as_str().to_string(),
            })
        }
    }
}

/// Active environments tracked by one provider instance
#[derive(Default)]
pub struct EnvironmentTable {
    environments: DashMap<String, Environment>,
}

impl EnvironmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, environment: Environment) {
        self.environments.insert(environment.id.clone(), environment);
    }

    pub fn get(&self, id: &str) -> Option<Environment> {
        self.environments.get(id).map(|e| e.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Environment> {
        self.environments.remove(id).map(|(_, e)| e)
    }

    pub fn ids(&self) -> Vec<String> {
        self.environments.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    /// Apply `f` to the environment in place
    pub fn update<F>(&self, id: &str, f: F) -> Result<Environment>
    where
        F: FnOnce(&mut Environment),
    {
        let mut entry = self
            .environments
            .get_mut(id)
            .ok_or_else(|| Error::EnvironmentNotFound(id.to_string()))?;
        f(&mut entry);
        Ok(entry.clone())
    }

    pub fn touch(&self, id: &str) {
        if let Some(mut entry) = self.environments.get_mut(id) {
            entry.last_activity = Utc::now();
        }
    }

    /// The environment if it exists and is `ready`
    pub fn require_ready(&self, id: &str) -> Result<Environment> {
        let environment = self
            .get(id)
            .ok_or_else(|| Error::EnvironmentNotFound(id.to_string()))?;
        if !environment.is_ready() {
            return Err(Error::NotReady {
                resource: format!("Environment {}", id),
                state: environment.status.as_str().to_string(),
            });
        }
        Ok(environment)
    }

    /// Mark as `destroying` and hand back the entry; `None` when unknown
    pub fn begin_destroy(&self, id: &str) -> Option<Environment> {
        let mut entry = self.environments.get_mut(id)?;
        entry.transition_to(EnvironmentStatus::Destroying);
        Some(entry.clone())
    }

    /// Put a failed teardown back so a later destroy can retry it
    pub fn restore_failed(&self, mut environment: Environment, message: String) {
        environment.status = EnvironmentStatus::Error;
        environment.error_message = Some(message);
        self.insert(environment);
    }
}

/// Labels stamped on every backend resource of a sandbox
pub fn sandbox_labels(request: &CreateEnvironmentRequest, environment_id: &str) -> HashMap<String, String> {
    HashMap::from([
        ("workshop.environment.id".to_string(), environment_id.to_string()),
        ("workshop.session.id".to_string(), request.session_id.clone()),
        ("workshop.template.id".to_string(), request.template_id.clone()),
        ("workshop.user.id".to_string(), request.user_id.clone()),
    ])
}

/// Outcome of reading a file for a content probe
pub(crate) fn file_outcome(path: &str, result: CommandResult) -> ProbeOutcome {
    if result.success() {
        ProbeOutcome {
            found: true,
            actual: Value::String(result.stdout),
            detail: format!("Read {}", path),
        }
    } else {
        ProbeOutcome {
            found: false,
            actual: Value::Null,
            detail: format!("Cannot read {}: {}", path, result.stderr.trim()),
        }
    }
}

/// Outcome of a custom command probe; JSON stdout is parsed
pub(crate) fn command_outcome(result: CommandResult) -> ProbeOutcome {
    let trimmed = result.stdout.trim();
    let actual = serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()));
    ProbeOutcome {
        found: result.success(),
        actual,
        detail: if result.success() {
            "Command succeeded".to_string()
        } else {
            format!(
                "Command exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            )
        },
    }
}

/// Split a command line into words, honouring single and double quotes
pub fn split_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in command.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }

    words
}
