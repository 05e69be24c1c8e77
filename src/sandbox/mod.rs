//! Sandbox traits and implementations for isolated task execution.
//!
//! Every task attempt gets its own isolated Linux environment with the task
//! repository checked out at `base_commit` and the whole tree stripped of
//! write permission. The solver interacts with it through exactly three
//! primitives, all policy-checked:
//!
//! - bash execution with working-directory tracking,
//! - patch application through a short write-permission window,
//! - debug runs against a throwaway snapshot.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SandboxProvider                          │
//! │  provision(task) ──────────► Sandbox                        │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sandbox                              │
//! │  execute_bash(cmd)  ──► BashResult   (policy-checked)       │
//! │  apply_patch(diff)  ──► PatchOutcome (write window)         │
//! │  execute_debug(..)  ──► BashResult   (throwaway snapshot)   │
//! │  run_command(cmd)   ──► BashResult   (harness-side)         │
//! │  stop()                              (idempotent)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The provider/sandbox split keeps the orchestrator and validator unaware
//! of Docker: both are generic over [`Sandbox`], which is also what makes
//! the conversation loop unit-testable against an in-memory fake.
//!
//! # Filesystem invariants
//!
//! 1. `cwd` is always a descendant of the repo root.
//! 2. Outside patch-application windows the repo tree carries no write
//!    permission for any principal.
//! 3. Files touched by the task's test patch (the protected set) are
//!    write-denied even inside patch-application windows.
//! 4. A sandbox is destroyed exactly once per attempt; `stop()` is
//!    idempotent and survives a container that already crashed.

pub mod diff;
pub mod docker;
pub mod policy;

#[cfg(test)]
pub(crate) mod fake;

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::task::TaskRecord;

/// Repository checkout location inside every sandbox.
pub const REPO_ROOT: &str = "/workspace/repo";

/// Solver scratch space inside the repo (appended to the VCS ignore list).
pub const AGENT_SCRATCH_DIR: &str = "/workspace/repo/.agent_temp";

/// Harness-internal staging area for dependency manifests.
pub const ENV_MANIFEST_DIR: &str = "/tmp/env_reqs";

/// Longest stdout a solver ever sees from one command, in bytes.
pub const MAX_STDOUT_BYTES: usize = 10_000;

/// Longest stderr a solver ever sees from one command, in bytes.
pub const MAX_STDERR_BYTES: usize = 2_000;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised while provisioning or operating a sandbox.
///
/// Operation-level failures (a command that exits non-zero, a rejected
/// path) are *not* errors: they come back inside [`BashResult`] /
/// [`PatchOutcome`] so the orchestrator can relay them to the solver.
/// These variants are reserved for failures that abort the attempt.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The base image could not be built or pulled.
    #[error("Image build failed: {0}")]
    ImageBuild(String),

    /// The container failed to start.
    #[error("Failed to start container: {0}")]
    ContainerStart(String),

    /// Cloning the task repository failed.
    #[error("Clone failed: {0}")]
    Clone(String),

    /// Checking out `base_commit` failed.
    #[error("Checkout failed: {0}")]
    Checkout(String),

    /// Transport-level failure talking to the container runtime.
    #[error("Container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// I/O error on the harness side.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of running a bash command inside the sandbox.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BashResult {
    /// Working directory after the command (always inside the repo root).
    pub cwd: String,
    pub stdout: String,
    pub stderr: String,
    /// `true` iff the command ran and exited zero. Policy rejections and
    /// timeouts report `false` without necessarily invoking a shell.
    pub success: bool,
}

impl BashResult {
    /// A policy rejection or operational failure carrying only stderr.
    pub fn denied(cwd: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

/// Result of a patch-application window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PatchOutcome {
    /// `true` iff at least one apply strategy succeeded.
    pub success: bool,
    pub stdout: String,
    /// Final stderr of the last strategy tried; surfaced to the solver for
    /// a retry when `success` is false.
    pub stderr: String,
}

impl PatchOutcome {
    pub fn rejected(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Point-in-time introspection of a sandbox, for logs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SandboxStatusSnapshot {
    pub container_id: Option<String>,
    pub is_running: bool,
    pub cwd: String,
    pub repo_root: String,
    pub task_id: String,
}

/// An isolated execution environment for one task attempt.
///
/// Implementations own their backing resource (a container, a chroot) and
/// are responsible for releasing it on every exit path; `stop()` must be
/// safe to call any number of times.
#[async_trait]
pub trait Sandbox: Send {
    /// Current working directory (a descendant of the repo root).
    fn cwd(&self) -> &str;

    /// Interpreter version provisioned for this task.
    fn python_version(&self) -> &str;

    /// When the sandbox finished provisioning; task budgets count from here.
    fn started_at(&self) -> Instant;

    /// Execute a solver bash command under the full policy set: blocked
    /// system paths, restricted VCS references, and `cd` boundary tracking.
    /// Output is truncated to [`MAX_STDOUT_BYTES`] / [`MAX_STDERR_BYTES`].
    async fn execute_bash(&mut self, command: &str, timeout: Duration) -> BashResult;

    /// Apply a unified diff through a write-permission window. Protected
    /// files stay write-denied throughout; the tree returns to read-only
    /// before this resolves.
    async fn apply_patch(&mut self, patch: &str) -> PatchOutcome;

    /// Run `command` against a throwaway snapshot of the current state with
    /// write permission enabled and `patch` (if any) pre-applied. Nothing
    /// leaks back into the authoritative sandbox.
    async fn execute_debug(
        &mut self,
        patch: Option<&str>,
        command: &str,
        timeout: Duration,
    ) -> BashResult;

    /// Harness-side execution: no policy checks, no output truncation.
    /// Used by the validator and provisioning diagnostics only — solver
    /// input never reaches this path.
    async fn run_command(&self, command: &str, timeout: Duration) -> BashResult;

    /// Destroy the sandbox and any temporaries. Idempotent.
    async fn stop(&mut self);
}

/// Factory that provisions one sandbox per task attempt.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    type Sandbox: Sandbox;

    /// Provision a fresh, started sandbox for `task`. On failure all
    /// partially-created resources are released before the error returns.
    async fn provision(&self, task: &TaskRecord) -> SandboxResult<Self::Sandbox>;
}

/// Truncate to a byte budget without splitting a UTF-8 code point.
pub(crate) fn truncate_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
