//! Session orchestrator
//!
//! Owns the active-session table and is the only component that asks a
//! provider to create or destroy a sandbox. Operations on one session are
//! serialized through a per-session lock; different sessions never contend.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::validation::{self, RulesReport, StepCheck, StepValidationResult};
use crate::config::Config;
use crate::domain::environment::{
    CommandResult, ConfigurationKind, Environment, EnvironmentConfig, ExecOptions, LogOptions,
    LogOutput, StatusSnapshot,
};
use crate::domain::session::{
    SessionStatus, StartSessionOptions, WorkshopSession, MAX_SESSION_MINUTES,
};
use crate::domain::template::WorkshopTemplate;
use crate::error::{Error, Result};
use crate::infra::session_store::SessionStore;
use crate::infra::store::Store;
use crate::provider::factory::DEFAULT_PROVIDER;
use crate::provider::{CreateEnvironmentRequest, EnvironmentProvider, ProviderFactory};

/// Everything resolved once at session start
struct SessionRuntime {
    lock: Arc<Mutex<()>>,
    provider: Arc<dyn EnvironmentProvider>,
    template: Arc<WorkshopTemplate>,
    checks: Vec<StepCheck>,
    /// Flipped to `true` when the session ends; open log streams stop on it
    closed: watch::Sender<bool>,
}

/// Session plus whatever the backend currently reports
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    pub session: WorkshopSession,
    pub environment: Option<Environment>,
    pub health: Option<StatusSnapshot>,
}

pub struct SessionOrchestrator {
    store: Arc<dyn Store>,
    sessions: Arc<dyn SessionStore>,
    factory: Arc<ProviderFactory>,
    config: Arc<Config>,
    runtimes: DashMap<String, Arc<SessionRuntime>>,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<dyn SessionStore>,
        factory: Arc<ProviderFactory>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            sessions,
            factory,
            config,
            runtimes: DashMap::new(),
        }
    }

    /// Provision a sandbox for `template_id` and open a session on it
    pub async fn start_session(
        &self,
        template_id: &str,
        user_id: &str,
        options: StartSessionOptions,
    ) -> Result<WorkshopSession> {
        if user_id.is_empty() {
            return Err(Error::InvalidRequest("user id is required".to_string()));
        }
        let template = Arc::new(self.store.get_template(template_id).await?);

        let backend = options
            .backend
            .or(template.backend)
            .unwrap_or(self.config.default_backend);
        let provider_name = options.provider_name.as_deref().unwrap_or(DEFAULT_PROVIDER);
        let provider = self.factory.get(backend, provider_name)?;

        let duration_minutes = options
            .duration_minutes
            .or(template.duration_minutes)
            .unwrap_or(self.config.default_session_minutes);
        if duration_minutes == 0 || duration_minutes > MAX_SESSION_MINUTES {
            return Err(Error::InvalidRequest(format!(
                "duration must be between 1 and {} minutes",
                MAX_SESSION_MINUTES
            )));
        }

        let mut session = WorkshopSession::new(
            Uuid::new_v4().to_string(),
            template.id.clone(),
            user_id.to_string(),
            backend,
            template.steps.iter().map(|s| s.id.as_str()),
            duration_minutes,
        );
        info!(
            "Starting session {} for user {} on template {} ({} backend)",
            session.id, user_id, template.id, backend
        );

        let (closed, _) = watch::channel(false);
        let runtime = Arc::new(SessionRuntime {
            lock: Arc::new(Mutex::new(())),
            provider: provider.clone(),
            template: template.clone(),
            checks: template.steps.iter().map(StepCheck::compile).collect(),
            closed,
        });
        let _guard = runtime.lock.clone().lock_owned().await;

        self.store.create_session(&session).await?;
        self.sessions.put(session.clone()).await?;
        self.runtimes.insert(session.id.clone(), runtime);

        let mut env = template.env.clone();
        env.extend(options.env);
        let request = CreateEnvironmentRequest {
            session_id: session.id.clone(),
            template_id: template.id.clone(),
            user_id: user_id.to_string(),
            config: EnvironmentConfig {
                resources: template.resources.clone(),
                networking: template.networking.clone(),
                duration_minutes,
                env,
                init_scripts: template.init_scripts.clone(),
                volumes: template.volumes.clone(),
                kind: template.kind.clone(),
                privileged: template.privileged,
            },
        };

        let environment = match provider.create_environment(request).await {
            Ok(environment) => environment,
            Err(e) => {
                error!("Failed to provision session {}: {}", session.id, e);
                self.abandon_start(session).await;
                return Err(match e {
                    e @ Error::ProvisioningFailed(_) => e,
                    e => Error::ProvisioningFailed(e.to_string()),
                });
            }
        };

        if let Some(initial) = &template.initial_configuration {
            if let Err(e) = provider
                .apply_configuration(&environment.id, &initial.payload, initial.kind)
                .await
            {
                error!(
                    "Failed to apply initial {} for session {}: {}",
                    initial.kind.as_str(),
                    session.id,
                    e
                );
                if let Err(destroy_err) = provider.destroy_environment(&environment.id).await {
                    error!(
                        "Failed to destroy environment {} after setup failure: {}",
                        environment.id, destroy_err
                    );
                }
                self.abandon_start(session).await;
                return Err(Error::ProvisioningFailed(format!(
                    "Initial configuration failed: {}",
                    e
                )));
            }
        }

        session.assign_environment(&environment.id);
        session.transition_to(SessionStatus::Active);
        self.persist(&session).await?;

        info!(
            "Session {} is active on environment {}",
            session.id, environment.id
        );
        Ok(session)
    }

    /// Mark a session that never became active as failed and drop it
    async fn abandon_start(&self, mut session: WorkshopSession) {
        session.transition_to(SessionStatus::Failed);
        if let Err(e) = self.store.update_session(&session).await {
            error!("Failed to record failure of session {}: {}", session.id, e);
        }
        if let Err(e) = self.sessions.remove(&session.id).await {
            warn!("Failed to drop session {}: {}", session.id, e);
        }
        self.runtimes.remove(&session.id);
    }

    async fn persist(&self, session: &WorkshopSession) -> Result<()> {
        self.sessions.put(session.clone()).await?;
        self.store.update_session(session).await
    }

    fn runtime(&self, session_id: &str) -> Result<Arc<SessionRuntime>> {
        self.runtimes
            .get(session_id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Take the session lock and load the current record
    ///
    /// A session ended while waiting for the lock is reported as not found.
    async fn enter(
        &self,
        session_id: &str,
    ) -> Result<(Arc<SessionRuntime>, OwnedMutexGuard<()>, WorkshopSession)> {
        let runtime = self.runtime(session_id)?;
        let guard = runtime.lock.clone().lock_owned().await;
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        Ok((runtime, guard, session))
    }

    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        let (runtime, _guard, mut session) = self.enter(session_id).await?;
        let environment_id = active_environment(&session)?;

        let argv = runtime.provider.command_argv(command);
        if argv.is_empty() {
            return Err(Error::InvalidRequest("command is empty".to_string()));
        }
        let options = ExecOptions {
            timeout_ms: options.timeout_ms.or(Some(self.config.command_timeout_ms)),
            ..options
        };

        let result = runtime
            .provider
            .execute_command(&environment_id, argv, options)
            .await?;

        session.touch();
        self.sessions.put(session).await?;
        Ok(result)
    }

    /// Check one step against the live sandbox and record the attempt
    pub async fn validate_step(
        &self,
        session_id: &str,
        step_id: &str,
    ) -> Result<StepValidationResult> {
        let (runtime, _guard, mut session) = self.enter(session_id).await?;
        let environment_id = active_environment(&session)?;
        let index = runtime
            .template
            .step_index(step_id)
            .ok_or_else(|| Error::StepNotFound(step_id.to_string()))?;

        let verdict =
            validation::run_check(runtime.provider.as_ref(), &environment_id, &runtime.checks[index])
                .await;
        let score = if verdict.passed {
            runtime.template.steps[index].score()
        } else {
            0
        };

        session.record_attempt(index, verdict.passed, score, verdict.feedback.clone());
        if session.all_steps_completed() && session.transition_to(SessionStatus::Completed) {
            info!(
                "Session {} completed with score {}",
                session.id, session.total_score
            );
        }
        let attempts = session.progress[index].attempts;
        self.persist(&session).await?;

        Ok(StepValidationResult {
            step_id: step_id.to_string(),
            valid: verdict.passed,
            score,
            feedback: verdict.feedback,
            evaluated: verdict.evaluated,
            attempts,
        })
    }

    pub async fn get_session_status(&self, session_id: &str) -> Result<SessionStatusView> {
        let live = match self.runtimes.get(session_id).map(|r| r.clone()) {
            Some(runtime) => self
                .sessions
                .get(session_id)
                .await?
                .map(|session| (runtime, session)),
            None => None,
        };

        let Some((runtime, session)) = live else {
            let session = self.store.get_session(session_id).await?;
            return Ok(SessionStatusView {
                session,
                environment: None,
                health: None,
            });
        };

        let environment = session
            .environment_id
            .as_deref()
            .and_then(|id| runtime.provider.get_environment(id));
        let health = match &environment {
            Some(environment) => match runtime.provider.get_environment_status(&environment.id).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(
                        "Failed to read status of environment {}: {}",
                        environment.id, e
                    );
                    None
                }
            },
            None => None,
        };

        Ok(SessionStatusView {
            session,
            environment,
            health,
        })
    }

    /// Buffered logs, or a stream that ends no later than the session
    pub async fn get_session_logs(
        &self,
        session_id: &str,
        target: Option<&str>,
        options: LogOptions,
    ) -> Result<LogOutput> {
        let (runtime, _guard, session) = self.enter(session_id).await?;
        let environment_id = session.environment_id.clone().ok_or_else(|| Error::NotReady {
            resource: format!("Session {}", session_id),
            state: session.status.as_str().to_string(),
        })?;

        let output = runtime
            .provider
            .get_logs(&environment_id, target, &options)
            .await?;

        Ok(match output {
            LogOutput::Stream(stream) => {
                let mut closed = runtime.closed.subscribe();
                let ended = async move {
                    let _ = closed.wait_for(|closed| *closed).await;
                };
                LogOutput::Stream(stream.take_until(ended).boxed())
            }
            text => text,
        })
    }

    pub async fn apply_configuration(
        &self,
        session_id: &str,
        payload: &str,
        kind: ConfigurationKind,
    ) -> Result<()> {
        let (runtime, _guard, mut session) = self.enter(session_id).await?;
        let environment_id = active_environment(&session)?;

        runtime
            .provider
            .apply_configuration(&environment_id, payload, kind)
            .await?;
        info!(
            "Applied {} to session {}",
            kind.as_str(),
            session_id
        );

        session.touch();
        self.sessions.put(session).await
    }

    /// Suspend an active session; commands and validations are refused until it ends
    pub async fn pause_session(&self, session_id: &str) -> Result<WorkshopSession> {
        let (_runtime, _guard, mut session) = self.enter(session_id).await?;
        if !session.transition_to(SessionStatus::Paused) {
            return Err(Error::NotReady {
                resource: format!("Session {}", session_id),
                state: session.status.as_str().to_string(),
            });
        }
        self.persist(&session).await?;
        info!("Session {} paused", session_id);
        Ok(session)
    }

    /// Score the template's rules against the sandbox without touching progress
    pub async fn evaluate_rules(&self, session_id: &str) -> Result<RulesReport> {
        let (runtime, _guard, session) = self.enter(session_id).await?;
        let environment_id = match session.status {
            SessionStatus::Active | SessionStatus::Completed => session.environment_id.clone(),
            _ => None,
        }
        .ok_or_else(|| Error::NotReady {
            resource: format!("Session {}", session_id),
            state: session.status.as_str().to_string(),
        })?;

        Ok(validation::evaluate_rules(
            runtime.provider.as_ref(),
            &environment_id,
            &runtime.template.validation_rules,
        )
        .await)
    }

    pub async fn list_active_sessions(&self) -> Result<Vec<WorkshopSession>> {
        let mut sessions = self.sessions.list().await?;
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    /// Destroy the sandbox, persist the final record and forget the session
    ///
    /// A session that has not completed is recorded as failed.
    pub async fn end_session(&self, session_id: &str) -> Result<WorkshopSession> {
        self.finish(session_id, SessionStatus::Failed).await
    }

    async fn finish(&self, session_id: &str, outcome: SessionStatus) -> Result<WorkshopSession> {
        let (runtime, _guard, mut session) = self.enter(session_id).await?;

        if let Some(environment_id) = &session.environment_id {
            if let Err(e) = runtime.provider.destroy_environment(environment_id).await {
                error!(
                    "Failed to destroy environment {} of session {}: {}",
                    environment_id, session_id, e
                );
                return Err(e);
            }
        }
        runtime.closed.send_replace(true);

        if !session.status.is_terminal() {
            session.transition_to(outcome);
        }
        self.store.update_session(&session).await?;
        self.sessions.remove(session_id).await?;
        self.runtimes.remove(session_id);

        info!(
            "Session {} ended as {} with score {}",
            session_id,
            session.status.as_str(),
            session.total_score
        );
        Ok(session)
    }

    /// End every session past its expiry through the regular end path
    ///
    /// Returns how many sessions were ended; failures are logged and skipped.
    pub async fn sweep_expired(&self) -> usize {
        let sessions = match self.sessions.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("Failed to list sessions for expiry sweep: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut ended = 0;
        for session in sessions.into_iter().filter(|s| s.is_expired(now)) {
            match self.finish(&session.id, SessionStatus::Expired).await {
                Ok(_) => ended += 1,
                Err(Error::SessionNotFound(_)) => {}
                Err(e) => warn!("Failed to expire session {}: {}", session.id, e),
            }
        }

        if ended > 0 {
            info!("Expiry sweep ended {} session(s)", ended);
        }
        ended
    }

    /// End every open follow-log stream while leaving sessions untouched
    pub fn close_streams(&self) {
        for runtime in self.runtimes.iter() {
            runtime.closed.send_replace(true);
        }
        info!("Closed log streams of {} session(s)", self.runtimes.len());
    }
}

/// Environment id of a session that accepts participant actions
fn active_environment(session: &WorkshopSession) -> Result<String> {
    match (&session.status, &session.environment_id) {
        (SessionStatus::Active, Some(id)) => Ok(id.clone()),
        _ => Err(Error::NotReady {
            resource: format!("Session {}", session.id),
            state: session.status.as_str().to_string(),
        }),
    }
}
