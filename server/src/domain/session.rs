//! Workshop session domain model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::environment::BackendType;

/// Longest session a participant may request
pub const MAX_SESSION_MINUTES: u64 = 7 * 24 * 60;

/// `start` plus `minutes`, capped at [`MAX_SESSION_MINUTES`]
pub fn expiry_after(start: DateTime<Utc>, minutes: u64) -> DateTime<Utc> {
    let minutes = minutes.min(MAX_SESSION_MINUTES) as i64;
    start + Duration::minutes(minutes)
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Sandbox is being provisioned
    Starting,
    /// Participant is working through the steps
    Active,
    /// Suspended by an operator; not resumed automatically
    Paused,
    /// Every step passed
    Completed,
    /// Provisioning or an unrecoverable runtime fault
    Failed,
    /// Swept after `expires_at`
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(SessionStatus::Starting),
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Expired
        )
    }
}

/// Per-step progress entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub step_id: String,
    pub completed: bool,
    pub score: u32,
    pub attempts: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub feedback: Option<String>,
}

/// One participant's attempt at a template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkshopSession {
    pub id: String,
    pub template_id: String,
    pub user_id: String,
    pub environment_id: Option<String>,
    pub backend: BackendType,
    pub status: SessionStatus,
    pub current_step: usize,
    pub progress: Vec<StepProgress>,
    pub total_score: u32,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

impl WorkshopSession {
    /// Create a new session with one unattempted progress entry per step
    pub fn new<'a>(
        id: String,
        template_id: String,
        user_id: String,
        backend: BackendType,
        step_ids: impl IntoIterator<Item = &'a str>,
        duration_minutes: u64,
    ) -> Self {
        let now = Utc::now();
        let progress = step_ids
            .into_iter()
            .map(|step_id| StepProgress {
                step_id: step_id.to_string(),
                ..Default::default()
            })
            .collect();

        Self {
            id,
            template_id,
            user_id,
            environment_id: None,
            backend,
            status: SessionStatus::Starting,
            current_step: 0,
            progress,
            total_score: 0,
            started_at: now,
            expires_at: expiry_after(now, duration_minutes),
            completed_at: None,
            last_activity: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Assign the environment; the id is immutable once set
    pub fn assign_environment(&mut self, environment_id: &str) -> bool {
        if self.environment_id.is_some() {
            return false;
        }
        self.environment_id = Some(environment_id.to_string());
        true
    }

    /// Transition to a new state
    pub fn transition_to(&mut self, new_status: SessionStatus) -> bool {
        let valid_transition = match (self.status, new_status) {
            (SessionStatus::Starting, SessionStatus::Active) => true,
            (SessionStatus::Starting, SessionStatus::Failed) => true,
            (SessionStatus::Starting, SessionStatus::Expired) => true,
            (SessionStatus::Active, SessionStatus::Completed) => true,
            (SessionStatus::Active, SessionStatus::Failed) => true,
            (SessionStatus::Active, SessionStatus::Expired) => true,
            (SessionStatus::Active, SessionStatus::Paused) => true,
            (SessionStatus::Paused, SessionStatus::Expired) => true,
            (SessionStatus::Paused, SessionStatus::Failed) => true,
            _ => false,
        };

        if valid_transition {
            self.status = new_status;
            if new_status.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        }

        valid_transition
    }

    /// Record a validation attempt for the step at `index`
    ///
    /// Only a passing attempt marks the step complete and advances
    /// `current_step`; every attempt bumps the attempt counter.
    pub fn record_attempt(&mut self, index: usize, passed: bool, score: u32, feedback: String) {
        let now = Utc::now();
        let Some(entry) = self.progress.get_mut(index) else {
            return;
        };

        entry.attempts += 1;
        entry.feedback = Some(feedback);
        if passed {
            entry.completed = true;
            entry.score = score;
            entry.completed_at = Some(now);
            self.current_step = self.current_step.max(index + 1);
        }

        self.total_score = self.recompute_total();
        self.last_activity = now;
    }

    /// Sum of scores over completed entries only
    pub fn recompute_total(&self) -> u32 {
        self.progress
            .iter()
            .filter(|p| p.completed)
            .map(|p| p.score)
            .sum()
    }

    pub fn all_steps_completed(&self) -> bool {
        self.progress.iter().all(|p| p.completed)
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Options accepted when starting a session
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionOptions {
    /// Overrides the template / server default backend
    pub backend: Option<BackendType>,
    /// Logical provider name; "default" when unset
    pub provider_name: Option<String>,
    pub duration_minutes: Option<u64>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(steps: &[&str]) -> WorkshopSession {
        WorkshopSession::new(
            "s1".into(),
            "t1".into(),
            "u1".into(),
            BackendType::Container,
            steps.iter().copied(),
            60,
        )
    }

    #[test]
    fn test_progress_initialized_per_step() {
        let s = session(&["a", "b"]);
        assert_eq!(s.progress.len(), 2);
        assert!(s.progress.iter().all(|p| !p.completed && p.attempts == 0));
        assert_eq!(s.status, SessionStatus::Starting);
    }

    #[test]
    fn test_failed_attempt_does_not_complete_or_score() {
        let mut s = session(&["a", "b"]);
        s.record_attempt(0, false, 0, "nope".into());
        assert_eq!(s.progress[0].attempts, 1);
        assert!(!s.progress[0].completed);
        assert!(s.progress[0].completed_at.is_none());
        assert_eq!(s.current_step, 0);
        assert_eq!(s.total_score, 0);
    }

    #[test]
    fn test_current_step_never_regresses() {
        let mut s = session(&["a", "b", "c"]);
        s.record_attempt(2, true, 10, "ok".into());
        assert_eq!(s.current_step, 3);
        s.record_attempt(0, true, 10, "ok".into());
        assert_eq!(s.current_step, 3);
        s.record_attempt(1, false, 0, "no".into());
        assert_eq!(s.current_step, 3);
        assert_eq!(s.total_score, 20);
    }

    #[test]
    fn test_revalidation_overwrites_score() {
        let mut s = session(&["a"]);
        s.record_attempt(0, true, 10, "ok".into());
        s.record_attempt(0, true, 7, "ok again".into());
        assert_eq!(s.progress[0].attempts, 2);
        assert_eq!(s.total_score, 7);
    }

    #[test]
    fn test_environment_assignment_is_immutable() {
        let mut s = session(&["a"]);
        assert!(s.assign_environment("env-1"));
        assert!(!s.assign_environment("env-2"));
        assert_eq!(s.environment_id.as_deref(), Some("env-1"));
    }

    #[test]
    fn test_transitions() {
        let mut s = session(&["a"]);
        assert!(!s.transition_to(SessionStatus::Completed));
        assert!(s.transition_to(SessionStatus::Active));
        assert!(s.transition_to(SessionStatus::Paused));
        assert!(!s.transition_to(SessionStatus::Active));
        assert!(s.transition_to(SessionStatus::Expired));
        assert!(s.completed_at.is_some());
        assert!(!s.transition_to(SessionStatus::Failed));
    }

    #[test]
    fn test_huge_duration_is_capped_not_wrapped() {
        for minutes in [u64::MAX, 1_000_000_000_000] {
            let s = WorkshopSession::new(
                "s1".into(),
                "t1".into(),
                "u1".into(),
                BackendType::Container,
                ["a"],
                minutes,
            );
            assert!(s.expires_at > s.started_at);
            assert_eq!(
                s.expires_at - s.started_at,
                Duration::minutes(MAX_SESSION_MINUTES as i64)
            );
        }
    }
}
