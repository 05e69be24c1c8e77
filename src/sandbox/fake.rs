//! In-memory sandbox fake for conversation-loop and driver tests.
//!
//! Runs the real policy checks but no containers: commands that pass policy
//! are appended to a shared log and answered with scripted results. Tests
//! keep a handle on the shared state to assert what reached "the shell"
//! after the sandbox has been consumed and stopped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{BashResult, PatchOutcome, REPO_ROOT, Sandbox, SandboxError, SandboxProvider, diff, policy};
use crate::task::TaskRecord;

/// Per-attempt behaviour knobs.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    /// Fail provisioning outright.
    pub fail_provision: bool,
    /// Number of patch applications that fail before one succeeds.
    pub patch_failures: u32,
    /// Validation commands containing any of these substrings fail.
    pub fail_tests: Vec<String>,
    /// Pretend each bash command took this long (ages `started_at`), so
    /// tests can trip the task deadline mid-conversation.
    pub bash_elapsed: Option<Duration>,
}

/// Shared, inspectable state of one fake sandbox.
#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub cwd: String,
    pub bash_log: Vec<String>,
    pub patch_log: Vec<String>,
    pub debug_log: Vec<String>,
    pub validator_log: Vec<String>,
    pub stop_calls: usize,
    pub patch_failures_remaining: u32,
    pub fail_tests: Vec<String>,
}

pub(crate) type SharedState = Arc<Mutex<FakeState>>;

pub(crate) struct FakeSandbox {
    state: SharedState,
    base_commit: String,
    protected_files: Vec<String>,
    dirs: HashSet<String>,
    started_at: Instant,
    bash_elapsed: Option<Duration>,
    python_version: String,
    cwd: String,
}

impl FakeSandbox {
    pub fn new(task: &TaskRecord, behavior: &FakeBehavior) -> (Self, SharedState) {
        let state = Arc::new(Mutex::new(FakeState {
            cwd: REPO_ROOT.to_string(),
            patch_failures_remaining: behavior.patch_failures,
            fail_tests: behavior.fail_tests.clone(),
            ..Default::default()
        }));
        let mut dirs = HashSet::new();
        dirs.insert(REPO_ROOT.to_string());
        dirs.insert(format!("{REPO_ROOT}/src"));
        dirs.insert(format!("{REPO_ROOT}/tests"));

        let sandbox = Self {
            state: state.clone(),
            base_commit: task.base_commit.clone(),
            protected_files: diff::patch_files(&task.test_patch),
            dirs,
            started_at: Instant::now(),
            bash_elapsed: behavior.bash_elapsed,
            python_version: "3.9".to_string(),
            cwd: REPO_ROOT.to_string(),
        };
        (sandbox, state)
    }

    fn success(&self, stdout: &str) -> BashResult {
        BashResult {
            cwd: self.cwd.clone(),
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn cwd(&self) -> &str {
        &self.cwd
    }

    fn python_version(&self) -> &str {
        &self.python_version
    }

    fn started_at(&self) -> Instant {
        self.started_at
    }

    async fn execute_bash(&mut self, command: &str, _timeout: Duration) -> BashResult {
        let command = command.trim();

        // Policy rejections return before anything is logged, mirroring the
        // real sandbox's "no shell invoked" guarantee.
        if let Some(blocked) = policy::blocked_path(command) {
            return BashResult::denied(
                &self.cwd,
                format!("Access denied: {blocked} is outside the allowed workspace"),
            );
        }
        if let Some(message) = policy::vcs_restriction(command, &self.base_commit) {
            return BashResult::denied(&self.cwd, message);
        }

        if !policy::is_compound(command) && (command == "cd" || command.starts_with("cd ")) {
            let target = command.split_whitespace().nth(1).unwrap_or("");
            let new_cwd = if target.is_empty() {
                REPO_ROOT.to_string()
            } else {
                policy::resolve_path(&self.cwd, target)
            };
            if !policy::is_within_repo(&new_cwd, REPO_ROOT) {
                return BashResult::denied(
                    &self.cwd,
                    format!("Cannot cd outside repo root ({REPO_ROOT})"),
                );
            }
            if !self.dirs.contains(&new_cwd) {
                return BashResult::denied(
                    &self.cwd,
                    format!("bash: cd: {target}: No such file or directory"),
                );
            }
            self.cwd = new_cwd.clone();
            self.state.lock().unwrap().cwd = new_cwd;
            return self.success("");
        }

        self.state.lock().unwrap().bash_log.push(command.to_string());
        if let Some(elapsed) = self.bash_elapsed {
            self.started_at -= elapsed;
        }
        self.success("ok\n")
    }

    async fn apply_patch(&mut self, patch: &str) -> PatchOutcome {
        if patch.trim().is_empty() {
            return PatchOutcome::rejected("Empty patch provided");
        }
        let violations = diff::protected_violations(patch, &self.protected_files);
        if !violations.is_empty() {
            return PatchOutcome::rejected(format!(
                "Cannot modify protected test files: {}",
                violations.join(", ")
            ));
        }

        let mut state = self.state.lock().unwrap();
        if state.patch_failures_remaining > 0 {
            state.patch_failures_remaining -= 1;
            return PatchOutcome {
                success: false,
                stdout: String::new(),
                stderr: "error: patch does not apply".to_string(),
            };
        }
        state.patch_log.push(patch.to_string());
        PatchOutcome {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    async fn execute_debug(
        &mut self,
        patch: Option<&str>,
        command: &str,
        _timeout: Duration,
    ) -> BashResult {
        if let Some(patch) = patch {
            let violations = diff::protected_violations(patch, &self.protected_files);
            if !violations.is_empty() {
                return BashResult::denied(
                    &self.cwd,
                    format!("Cannot modify protected test files: {}", violations.join(", ")),
                );
            }
        }
        self.state.lock().unwrap().debug_log.push(command.to_string());
        self.success("debug ok\n")
    }

    async fn run_command(&self, command: &str, _timeout: Duration) -> BashResult {
        let mut state = self.state.lock().unwrap();
        state.validator_log.push(command.to_string());
        let failed = state.fail_tests.iter().any(|t| command.contains(t.as_str()));
        BashResult {
            cwd: self.cwd.clone(),
            stdout: if failed { "1 failed\n".into() } else { "1 passed\n".into() },
            stderr: String::new(),
            success: !failed,
        }
    }

    async fn stop(&mut self) {
        self.state.lock().unwrap().stop_calls += 1;
    }
}

/// Provider handing out [`FakeSandbox`]es, one scripted behaviour per
/// provision call (falling back to the default behaviour).
#[derive(Default)]
pub(crate) struct FakeProvider {
    behaviors: Mutex<Vec<FakeBehavior>>,
    pub states: Mutex<Vec<SharedState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behaviours consumed in order by successive provisions.
    pub fn with_behaviors(behaviors: Vec<FakeBehavior>) -> Self {
        Self {
            behaviors: Mutex::new(behaviors),
            states: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    type Sandbox = FakeSandbox;

    async fn provision(&self, task: &TaskRecord) -> Result<FakeSandbox, SandboxError> {
        let behavior = {
            let mut queue = self.behaviors.lock().unwrap();
            if queue.is_empty() {
                FakeBehavior::default()
            } else {
                queue.remove(0)
            }
        };
        if behavior.fail_provision {
            return Err(SandboxError::ContainerStart("scripted failure".to_string()));
        }
        let (sandbox, state) = FakeSandbox::new(task, &behavior);
        self.states.lock().unwrap().push(state);
        Ok(sandbox)
    }
}
