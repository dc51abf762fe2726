//! Step and rule validation
//!
//! Steps are compiled once per session into a [`StepCheck`]; running a check
//! never fails. An attempt that cannot be evaluated is reported with
//! `evaluated = false` so the caller can still count it.

use serde::Serialize;
use serde_json::Value;

use crate::domain::environment::{ExecOptions, Probe, ProbeOutcome};
use crate::domain::template::{
    FileExpectation, ProbeKind, StepKind, ValidationRule, WorkshopStep,
};
use crate::error::Error;
use crate::provider::EnvironmentProvider;

/// Compiled check for one step
#[derive(Debug, Clone, PartialEq)]
pub enum StepCheck {
    /// Passes on every attempt
    AutoPass,
    /// Run `command` and look for `expected` in its stdout
    CommandOutput {
        command: String,
        expected: String,
        timeout_ms: Option<u64>,
    },
    Probe { probe: Probe, expected: Value },
    Files {
        files: Vec<FileExpectation>,
        timeout_ms: Option<u64>,
    },
    /// Answer is scored elsewhere; recorded as passed
    Quiz,
    /// The step cannot be checked as authored
    Invalid(String),
}

impl StepCheck {
    pub fn compile(step: &WorkshopStep) -> Self {
        match step.kind {
            StepKind::Instruction => StepCheck::AutoPass,
            StepKind::Quiz => StepCheck::Quiz,
            StepKind::Command => match (&step.expected_output, &step.expected_command) {
                (None, _) => StepCheck::AutoPass,
                (Some(expected), Some(command)) => StepCheck::CommandOutput {
                    command: command.clone(),
                    expected: expected.clone(),
                    timeout_ms: step.validation.as_ref().and_then(|v| v.timeout_ms),
                },
                (Some(expected), None) => match &step.validation {
                    Some(validation) => StepCheck::Probe {
                        probe: Probe {
                            kind: validation.kind,
                            target: validation.target.clone(),
                            timeout_ms: validation.timeout_ms,
                        },
                        expected: Value::String(expected.clone()),
                    },
                    None => StepCheck::Invalid(format!(
                        "Step {} expects output but declares no command to produce it",
                        step.id
                    )),
                },
            },
            StepKind::ResourceCheck => match &step.validation {
                Some(validation) if !validation.target.is_empty() => StepCheck::Probe {
                    probe: Probe {
                        kind: validation.kind,
                        target: validation.target.clone(),
                        timeout_ms: validation.timeout_ms,
                    },
                    expected: validation.expected.clone(),
                },
                _ => StepCheck::Invalid(format!("Step {} declares no resource to check", step.id)),
            },
            StepKind::FileEdit => {
                let Some(validation) = &step.validation else {
                    return StepCheck::Invalid(format!("Step {} declares no files to check", step.id));
                };
                let mut files = validation.files.clone();
                if files.is_empty()
                    && validation.kind == ProbeKind::FileContent
                    && !validation.target.is_empty()
                {
                    files.push(FileExpectation {
                        path: validation.target.clone(),
                        contains: expected_strings(&validation.expected),
                    });
                }
                if files.is_empty() {
                    StepCheck::Invalid(format!("Step {} declares no files to check", step.id))
                } else {
                    StepCheck::Files {
                        files,
                        timeout_ms: validation.timeout_ms,
                    }
                }
            }
        }
    }
}

fn expected_strings(expected: &Value) -> Vec<String> {
    match expected {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Outcome of one check run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// False when the check could not be evaluated at all
    pub evaluated: bool,
    pub passed: bool,
    pub feedback: String,
}

impl Verdict {
    fn pass(feedback: impl Into<String>) -> Self {
        Self {
            evaluated: true,
            passed: true,
            feedback: feedback.into(),
        }
    }

    fn fail(feedback: impl Into<String>) -> Self {
        Self {
            evaluated: true,
            passed: false,
            feedback: feedback.into(),
        }
    }

    fn unevaluated(error: Error) -> Self {
        let error = match error {
            e @ Error::ValidationError(_) => e,
            e => Error::ValidationError(e.to_string()),
        };
        Self {
            evaluated: false,
            passed: false,
            feedback: error.to_string(),
        }
    }
}

/// Result of a step validation, as returned to the participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepValidationResult {
    pub step_id: String,
    pub valid: bool,
    pub score: u32,
    pub feedback: String,
    pub evaluated: bool,
    pub attempts: u32,
}

pub async fn run_check(
    provider: &dyn EnvironmentProvider,
    environment_id: &str,
    check: &StepCheck,
) -> Verdict {
    match check {
        StepCheck::AutoPass => Verdict::pass("Step completed"),
        StepCheck::Quiz => Verdict::pass("Quiz answer recorded"),
        StepCheck::Invalid(reason) => Verdict::unevaluated(Error::ValidationError(reason.clone())),
        StepCheck::CommandOutput {
            command,
            expected,
            timeout_ms,
        } => {
            let argv = provider.command_argv(command);
            let options = ExecOptions {
                timeout_ms: *timeout_ms,
                ..Default::default()
            };
            match provider.execute_command(environment_id, argv, options).await {
                Ok(result) if !result.success() => Verdict::fail(format!(
                    "`{}` exited with {}: {}",
                    command,
                    result.exit_code,
                    result.stderr.trim()
                )),
                Ok(result) if result.stdout.contains(expected.as_str()) => {
                    Verdict::pass("Output matched")
                }
                Ok(_) => Verdict::fail(format!(
                    "Expected the output of `{}` to contain '{}'",
                    command, expected
                )),
                Err(e) => Verdict::unevaluated(e),
            }
        }
        StepCheck::Probe { probe, expected } => {
            match provider.probe(environment_id, probe).await {
                Ok(outcome) => judge_probe(probe, expected, &outcome),
                Err(e) => Verdict::unevaluated(e),
            }
        }
        StepCheck::Files { files, timeout_ms } => {
            for file in files {
                let probe = Probe {
                    kind: ProbeKind::FileContent,
                    target: file.path.clone(),
                    timeout_ms: *timeout_ms,
                };
                let outcome = match provider.probe(environment_id, &probe).await {
                    Ok(outcome) => outcome,
                    Err(e) => return Verdict::unevaluated(e),
                };
                if !outcome.found {
                    return Verdict::fail(format!("{} was not found", file.path));
                }
                let content = render(&outcome.actual);
                if let Some(missing) = file.contains.iter().find(|s| !content.contains(s.as_str())) {
                    return Verdict::fail(format!("{} does not contain '{}'", file.path, missing));
                }
            }
            Verdict::pass("All files match")
        }
    }
}

fn judge_probe(probe: &Probe, expected: &Value, outcome: &ProbeOutcome) -> Verdict {
    if probe_passes(probe.kind, expected, outcome) {
        return Verdict::pass(outcome.detail.clone());
    }
    match probe.kind {
        ProbeKind::ResourceExists | ProbeKind::EndpointReachable => {
            let wanted = expected.as_bool().unwrap_or(true);
            Verdict::fail(format!(
                "Expected {} to be {}",
                probe.target,
                if wanted { "present" } else { "absent" }
            ))
        }
        _ if !outcome.found => Verdict::fail(format!("{} was not found: {}", probe.target, outcome.detail)),
        _ => Verdict::fail(format!(
            "Expected {} to match {} but found {}",
            probe.target,
            expected,
            render(&outcome.actual)
        )),
    }
}

/// Presence kinds compare `found` with the expected flag; the rest
/// shallow-match the observed value
pub fn probe_passes(kind: ProbeKind, expected: &Value, outcome: &ProbeOutcome) -> bool {
    match kind {
        ProbeKind::ResourceExists | ProbeKind::EndpointReachable => {
            outcome.found == expected.as_bool().unwrap_or(true)
        }
        _ => outcome.found && (expected.is_null() || shallow_match(expected, &outcome.actual)),
    }
}

/// Expected string matches as a substring, expected object requires every
/// declared key to match, anything else must be equal
pub fn shallow_match(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::String(needle) => render(actual).contains(needle.as_str()),
        Value::Object(fields) => match actual {
            Value::Object(actual_fields) => fields.iter().all(|(key, want)| {
                actual_fields
                    .get(key)
                    .is_some_and(|got| shallow_match(want, got))
            }),
            _ => false,
        },
        _ => expected == actual,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Result of one template rule
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub name: String,
    pub kind: ProbeKind,
    pub passed: bool,
    pub evaluated: bool,
    pub weight: u32,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesReport {
    pub results: Vec<RuleResult>,
    pub passed_weight: u32,
    pub total_weight: u32,
    /// `passed_weight / total_weight`; 1.0 for an empty rule set
    pub score: f64,
}

pub async fn evaluate_rules(
    provider: &dyn EnvironmentProvider,
    environment_id: &str,
    rules: &[ValidationRule],
) -> RulesReport {
    let mut results = Vec::with_capacity(rules.len());
    for rule in rules {
        let probe = Probe {
            kind: rule.kind,
            target: rule.target.clone(),
            timeout_ms: None,
        };
        let check = StepCheck::Probe {
            probe,
            expected: rule.expected.clone(),
        };
        let verdict = run_check(provider, environment_id, &check).await;
        results.push(RuleResult {
            name: rule.name.clone(),
            kind: rule.kind,
            passed: verdict.passed,
            evaluated: verdict.evaluated,
            weight: rule.weight,
            detail: verdict.feedback,
        });
    }

    let total_weight: u32 = results.iter().map(|r| r.weight).sum();
    let passed_weight: u32 = results.iter().filter(|r| r.passed).map(|r| r.weight).sum();
    let score = if total_weight == 0 {
        1.0
    } else {
        passed_weight as f64 / total_weight as f64
    };

    RulesReport {
        results,
        passed_weight,
        total_weight,
        score,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::environment::{BackendType, EnvironmentConfig};
    use crate::provider::CreateEnvironmentRequest;
    use crate::testing::FakeProvider;

    fn step(value: Value) -> WorkshopStep {
        serde_json::from_value(value).unwrap()
    }

    async fn ready_env(provider: &FakeProvider) -> String {
        provider
            .create_environment(CreateEnvironmentRequest {
                session_id: "s1".into(),
                template_id: "t1".into(),
                user_id: "u1".into(),
                config: EnvironmentConfig::default(),
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_shallow_match() {
        assert!(shallow_match(&json!("Running"), &json!("pod is Running")));
        assert!(shallow_match(&json!("3"), &json!(3)));
        assert!(shallow_match(
            &json!({"status": {"phase": "Run"}}),
            &json!({"status": {"phase": "Running", "ip": "10.0.0.1"}, "kind": "Pod"})
        ));
        assert!(!shallow_match(&json!({"replicas": 2}), &json!({"replicas": 1})));
        assert!(!shallow_match(&json!({"replicas": 2}), &json!("2")));
        assert!(shallow_match(&json!(2), &json!(2)));
        assert!(!shallow_match(&json!(true), &json!("true")));
    }

    #[test]
    fn test_compile_dispatch() {
        let check = StepCheck::compile(&step(json!({"id": "a", "kind": "command"})));
        assert_eq!(check, StepCheck::AutoPass);

        let check = StepCheck::compile(&step(json!({
            "id": "b", "kind": "command",
            "expectedCommand": "python --version", "expectedOutput": "3.12"
        })));
        assert!(matches!(check, StepCheck::CommandOutput { .. }));

        let check = StepCheck::compile(&step(json!({
            "id": "b2", "kind": "command", "expectedOutput": "Python 3.12"
        })));
        assert!(matches!(check, StepCheck::Invalid(_)));

        let check = StepCheck::compile(&step(json!({"id": "c", "kind": "resource-check"})));
        assert!(matches!(check, StepCheck::Invalid(_)));

        let check = StepCheck::compile(&step(json!({
            "id": "d", "kind": "file-edit",
            "validation": {"kind": "file-content", "target": "/app/config.yaml", "expected": ["port: 8080", "debug"]}
        })));
        let StepCheck::Files { files, .. } = check else {
            panic!("expected file check");
        };
        assert_eq!(files[0].path, "/app/config.yaml");
        assert_eq!(files[0].contains, vec!["port: 8080", "debug"]);

        let check = StepCheck::compile(&step(json!({"id": "e", "kind": "quiz"})));
        assert_eq!(check, StepCheck::Quiz);
    }

    #[tokio::test]
    async fn test_resource_check_mismatch_fails() {
        let provider = FakeProvider::new(BackendType::Cluster);
        let env = ready_env(&provider).await;
        provider.set_probe("deployment/web", true, json!({"status": {"readyReplicas": 1}}));

        let check = StepCheck::compile(&step(json!({
            "id": "s", "kind": "resource-check",
            "validation": {"kind": "resource-status", "target": "deployment/web",
                           "expected": {"status": {"readyReplicas": 2}}}
        })));
        let verdict = run_check(&*provider, &env, &check).await;
        assert!(verdict.evaluated);
        assert!(!verdict.passed);
        assert!(verdict.feedback.contains("deployment/web"));
    }

    #[tokio::test]
    async fn test_probe_error_is_unevaluated() {
        let provider = FakeProvider::new(BackendType::Cluster);
        let env = ready_env(&provider).await;

        let check = StepCheck::compile(&step(json!({
            "id": "s", "kind": "resource-check",
            "validation": {"kind": "resource-exists", "target": "svc/api"}
        })));
        let verdict = run_check(&*provider, &env, &check).await;
        assert!(!verdict.evaluated);
        assert!(!verdict.passed);
        assert!(verdict.feedback.starts_with("Validation could not be evaluated"));
    }

    #[tokio::test]
    async fn test_absence_expectation() {
        let provider = FakeProvider::new(BackendType::Cluster);
        let env = ready_env(&provider).await;
        provider.set_probe("pod/debug", false, Value::Null);

        let check = StepCheck::compile(&step(json!({
            "id": "s", "kind": "resource-check",
            "validation": {"kind": "resource-exists", "target": "pod/debug", "expected": false}
        })));
        assert!(run_check(&*provider, &env, &check).await.passed);
    }

    #[tokio::test]
    async fn test_command_output() {
        let provider = FakeProvider::new(BackendType::Container);
        let env = ready_env(&provider).await;
        provider.set_command("python --version", "Python 3.12.1\n", 0);

        let check = StepCheck::CommandOutput {
            command: "python --version".into(),
            expected: "3.12".into(),
            timeout_ms: None,
        };
        assert!(run_check(&*provider, &env, &check).await.passed);

        let check = StepCheck::CommandOutput {
            command: "python --version".into(),
            expected: "3.11".into(),
            timeout_ms: None,
        };
        let verdict = run_check(&*provider, &env, &check).await;
        assert!(verdict.evaluated && !verdict.passed);
    }

    #[tokio::test]
    async fn test_file_check() {
        let provider = FakeProvider::new(BackendType::Container);
        let env = ready_env(&provider).await;
        provider.set_probe("/app/config.yaml", true, json!("port: 8080\ndebug: true\n"));

        let check = StepCheck::Files {
            files: vec![FileExpectation {
                path: "/app/config.yaml".into(),
                contains: vec!["port: 8080".into()],
            }],
            timeout_ms: None,
        };
        assert!(run_check(&*provider, &env, &check).await.passed);

        let check = StepCheck::Files {
            files: vec![FileExpectation {
                path: "/app/config.yaml".into(),
                contains: vec!["port: 9090".into()],
            }],
            timeout_ms: None,
        };
        let verdict = run_check(&*provider, &env, &check).await;
        assert!(!verdict.passed);
        assert!(verdict.feedback.contains("port: 9090"));
    }

    #[tokio::test]
    async fn test_weighted_rules() {
        let provider = FakeProvider::new(BackendType::Cluster);
        let env = ready_env(&provider).await;
        provider.set_probe("deployment/web", true, json!({}));
        provider.set_probe("svc/web", false, Value::Null);

        let rules: Vec<ValidationRule> = serde_json::from_value(json!([
            {"name": "web deployed", "kind": "resource-exists", "target": "deployment/web", "weight": 3},
            {"name": "web exposed", "kind": "resource-exists", "target": "svc/web", "weight": 1}
        ]))
        .unwrap();
        let report = evaluate_rules(&*provider, &env, &rules).await;
        assert_eq!(report.total_weight, 4);
        assert_eq!(report.passed_weight, 3);
        assert!((report.score - 0.75).abs() < f64::EPSILON);
        assert!(report.results[0].passed);
        assert!(!report.results[1].passed);

        let empty = evaluate_rules(&*provider, &env, &[]).await;
        assert_eq!(empty.score, 1.0);
    }
}
