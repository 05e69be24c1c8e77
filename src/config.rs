//! Evaluation request schema and budget defaults.
//!
//! An evaluation is kicked off by a single JSON request:
//!
//! ```json
//! {
//!   "participants": { "solver": "http://localhost:9010" },
//!   "config": { "instance_id": "django__django-11099", "max_turns": 10 }
//! }
//! ```
//!
//! `participants.solver` is mandatory; everything under `config` is optional
//! and falls back to the documented defaults. Malformed requests are
//! rejected at this boundary with a reason, before any sandbox exists.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wall-clock budget for one task attempt, measured from sandbox start.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;

/// Per-command timeout for solver bash/debug actions.
pub const DEFAULT_BASH_TIMEOUT_SECS: u64 = 30;

/// Timeout for a single solver messaging round trip.
pub const DEFAULT_SOLVER_TIMEOUT_SECS: u64 = 120;

/// Per-test timeout during validation.
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 120;

/// Errors rejecting an inbound evaluation request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The request body was not valid JSON or did not match the schema.
    #[error("Malformed evaluation request: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `participants.solver` was missing or empty.
    #[error("Evaluation request is missing required participant 'solver'")]
    MissingSolver,
}

/// Top-level inbound request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvalRequest {
    pub participants: Participants,

    #[serde(default)]
    pub config: EvalConfig,
}

/// External collaborators referenced by the request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Participants {
    /// Endpoint of the solver agent under evaluation.
    #[serde(default)]
    pub solver: Option<String>,
}

impl EvalRequest {
    /// Parse and validate a request body.
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let request: EvalRequest = serde_json::from_str(text)?;
        match request.participants.solver.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(request),
            _ => Err(RequestError::MissingSolver),
        }
    }

    /// The validated solver endpoint.
    pub fn solver_url(&self) -> &str {
        self.participants.solver.as_deref().unwrap_or_default()
    }
}

/// Task selection filters and conversation budgets.
///
/// Every field is optional in the wire format; the `default_*` functions
/// below are the single source of truth for budget defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvalConfig {
    /// Evaluate exactly this task (short-circuits other filters).
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Restrict to tasks from this repository.
    #[serde(default)]
    pub repo: Option<String>,

    /// Restrict to tasks with this difficulty tag.
    #[serde(default)]
    pub difficulty: Option<String>,

    /// Cap on the number of selected tasks.
    #[serde(default)]
    pub max_tasks: Option<usize>,

    /// Maximum solver dialogue rounds per attempt.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Per-command timeout for solver bash/debug actions, in seconds.
    #[serde(default = "default_bash_timeout")]
    pub bash_timeout: u64,

    /// Wall-clock budget per attempt, in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,

    /// Failed patch applications the solver may retry before the attempt
    /// terminates.
    #[serde(default = "default_max_patch_retries")]
    pub max_patch_retries: u32,

    /// Independent attempts per task (the `k` in pass@k).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_turns() -> u32 {
    10
}

fn default_bash_timeout() -> u64 {
    DEFAULT_BASH_TIMEOUT_SECS
}

fn default_task_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

fn default_max_patch_retries() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            repo: None,
            difficulty: None,
            max_tasks: None,
            max_turns: default_max_turns(),
            bash_timeout: default_bash_timeout(),
            task_timeout: default_task_timeout(),
            max_patch_retries: default_max_patch_retries(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl EvalConfig {
    pub fn bash_timeout(&self) -> Duration {
        Duration::from_secs(self.bash_timeout)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_request_with_defaults() {
        let request =
            EvalRequest::parse(r#"{"participants": {"solver": "http://localhost:9010"}}"#)
                .unwrap();
        assert_eq!(request.solver_url(), "http://localhost:9010");
        assert_eq!(request.config.max_turns, 10);
        assert_eq!(request.config.bash_timeout, 30);
        assert_eq!(request.config.task_timeout, 600);
        assert_eq!(request.config.max_patch_retries, 3);
        assert_eq!(request.config.max_attempts, 1);
        assert!(request.config.max_tasks.is_none());
    }

    #[test]
    fn overrides_apply() {
        let request = EvalRequest::parse(
            r#"{
                "participants": {"solver": "http://s"},
                "config": {"max_turns": 3, "task_timeout": 60, "max_attempts": 5,
                           "repo": "pallets/flask", "max_tasks": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(request.config.max_turns, 3);
        assert_eq!(request.config.task_timeout, 60);
        assert_eq!(request.config.max_attempts, 5);
        assert_eq!(request.config.repo.as_deref(), Some("pallets/flask"));
        assert_eq!(request.config.max_tasks, Some(2));
    }

    #[test]
    fn rejects_missing_solver() {
        let err = EvalRequest::parse(r#"{"participants": {}, "config": {}}"#).unwrap_err();
        assert!(matches!(err, RequestError::MissingSolver));

        let err = EvalRequest::parse(r#"{"participants": {"solver": "  "}}"#).unwrap_err();
        assert!(matches!(err, RequestError::MissingSolver));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = EvalRequest::parse("not a valid json request").unwrap_err();
        assert!(matches!(err, RequestError::Malformed(_)));
    }
}
