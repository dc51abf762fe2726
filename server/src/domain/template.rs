//! Workshop template domain model
//!
//! Templates are authored elsewhere and are read-only to the orchestrator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::environment::{BackendType, ConfigurationKind};

/// Score awarded to a passing step that does not declare its own points
pub const NOMINAL_STEP_SCORE: u32 = 10;

/// Immutable workshop definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkshopTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Environment kind, used by the container backend to pick a base image
    #[serde(default)]
    pub kind: Option<String>,
    /// Preferred backend; the server default applies when unset
    #[serde(default)]
    pub backend: Option<BackendType>,
    /// Suggested duration in minutes
    #[serde(default)]
    pub duration_minutes: Option<u64>,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub networking: NetworkingSpec,
    #[serde(default)]
    pub steps: Vec<WorkshopStep>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    /// Declarative configuration deployed right after the sandbox is ready
    #[serde(default)]
    pub initial_configuration: Option<InitialConfiguration>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub init_scripts: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    /// Only honoured by backends that permit it
    #[serde(default)]
    pub privileged: bool,
}

impl WorkshopTemplate {
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

/// Requested compute shape, in Kubernetes quantity notation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    pub cpu: String,
    pub memory: String,
    pub storage: String,
    #[serde(default)]
    pub gpu: Option<u32>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            storage: "1Gi".to_string(),
            gpu: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub ingress: bool,
    #[serde(default)]
    pub load_balancer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialConfiguration {
    pub kind: ConfigurationKind,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Instruction,
    Command,
    ResourceCheck,
    FileEdit,
    Quiz,
}

/// One unit of instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkshopStep {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub expected_command: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub validation: Option<StepValidation>,
    /// Score for passing this step, defaults to [`NOMINAL_STEP_SCORE`]
    #[serde(default)]
    pub points: Option<u32>,
}

impl WorkshopStep {
    pub fn score(&self) -> u32 {
        self.points.unwrap_or(NOMINAL_STEP_SCORE)
    }
}

/// Probe kinds shared by step validations and template rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    ResourceExists,
    ResourceStatus,
    EndpointReachable,
    FileContent,
    Custom,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::ResourceExists => "resource-exists",
            ProbeKind::ResourceStatus => "resource-status",
            ProbeKind::EndpointReachable => "endpoint-reachable",
            ProbeKind::FileContent => "file-content",
            ProbeKind::Custom => "custom",
        }
    }
}

/// Validation descriptor attached to a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepValidation {
    pub kind: ProbeKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub expected: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Explicit file expectations for file-edit steps
    #[serde(default)]
    pub files: Vec<FileExpectation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileExpectation {
    pub path: String,
    #[serde(default)]
    pub contains: Vec<String>,
}

/// Named, weighted check evaluated against the live sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    pub name: String,
    pub kind: ProbeKind,
    pub target: String,
    #[serde(default)]
    pub expected: Value,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_deserializes_from_authoring_json() {
        let raw = r#"{
            "id": "k8s-basics",
            "name": "Kubernetes basics",
            "category": "kubernetes",
            "difficulty": "intermediate",
            "backend": "cluster",
            "resources": {"cpu": "500m", "memory": "1Gi", "storage": "2Gi"},
            "networking": {"ports": [8080], "ingress": false, "loadBalancer": false},
            "steps": [
                {"id": "s1", "kind": "command", "content": "Run kubectl get pods"},
                {"id": "s2", "kind": "resource-check",
                 "validation": {"kind": "resource-status", "target": "deployment/web",
                                "expected": {"readyReplicas": 2}, "timeoutMs": 5000}}
            ],
            "validationRules": [
                {"name": "web exists", "kind": "resource-exists", "target": "deployment/web", "weight": 3}
            ]
        }"#;

        let template: WorkshopTemplate = serde_json::from_str(raw).unwrap();
        assert_eq!(template.difficulty, Difficulty::Intermediate);
        assert_eq!(template.backend, Some(BackendType::Cluster));
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.steps[1].kind, StepKind::ResourceCheck);
        let validation = template.steps[1].validation.as_ref().unwrap();
        assert_eq!(validation.kind, ProbeKind::ResourceStatus);
        assert_eq!(validation.timeout_ms, Some(5000));
        assert_eq!(template.validation_rules[0].weight, 3);
        assert_eq!(template.step_index("s2"), Some(1));
        assert_eq!(template.step_index("nope"), None);
    }

    #[test]
    fn test_step_score_defaults_to_nominal() {
        let step = WorkshopStep {
            id: "s".into(),
            kind: StepKind::Quiz,
            title: String::new(),
            content: String::new(),
            expected_command: None,
            expected_output: None,
            validation: None,
            points: None,
        };
        assert_eq!(step.score(), NOMINAL_STEP_SCORE);
    }
}
