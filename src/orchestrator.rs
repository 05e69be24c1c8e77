//! The conversational control loop between harness and solver.
//!
//! One attempt is one conversation: the orchestrator sends the solver the
//! task payload, interprets each reply as a single action, dispatches it
//! against the sandbox, and sends the structured result back — until a
//! patch applies cleanly, a budget runs out, or the transport fails.
//!
//! # Dispatch
//!
//! | Action | Effect | Next message to solver |
//! |--------|--------|------------------------|
//! | `bash` | `execute_bash` | `{cwd, stdout, stderr}` |
//! | `debug` | `execute_debug` | `{debug_result, cwd, stdout, stderr, success, note}` |
//! | `patch` (applies) | validator runs | — terminal |
//! | `patch` (fails, retries left) | retry counter bumped | `{patch_failed, cwd, stderr, message}` |
//! | unrecognised | recorded | `{error, message, cwd}` |
//!
//! # Budgets, in priority order
//!
//! 1. `task_timeout` — wall clock from sandbox start, checked at the head
//!    of every turn; an in-flight command finishes under its own timeout.
//! 2. `max_turns`.
//! 3. `max_patch_retries`.
//! 4. `bash_timeout` — per command.
//!
//! The loop is strictly sequential: one outstanding solver request or
//! sandbox command at a time, strictly monotone turn numbering, and the
//! sandbox is destroyed on every exit path.

use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::EvalConfig;
use crate::sandbox::Sandbox;
use crate::solver::SolverChannel;
use crate::task::TaskRecord;
use crate::validator::{ValidationSummary, Validator};

/// Longest content excerpt kept per transcript turn.
const SNIPPET_CHARS: usize = 200;

/// A solver reply, decoded into exactly one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Bash(String),
    Patch(String),
    Debug(String),
    /// Anything the forgiving parser could not make sense of.
    Invalid,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Bash(_) => ActionKind::Bash,
            Action::Patch(_) => ActionKind::Patch,
            Action::Debug(_) => ActionKind::Debug,
            Action::Invalid => ActionKind::Error,
        }
    }

    /// Canonical wire form of a decoded action.
    pub fn to_value(&self) -> Option<Value> {
        let (action, content) = match self {
            Action::Bash(c) => ("bash", c),
            Action::Patch(c) => ("patch", c),
            Action::Debug(c) => ("debug", c),
            Action::Invalid => return None,
        };
        Some(json!({ "action": action, "content": content }))
    }
}

/// Decode a raw solver reply. Tried in priority order:
///
/// 1. the whole reply is a JSON object with a valid `action`;
/// 2. its `content` field is (or encodes) such an object;
/// 3. a JSON object with an `action` field embedded somewhere in prose;
/// 4. raw text that looks like a unified diff is a patch.
///
/// Everything else is [`Action::Invalid`].
pub fn parse_reply(reply: &str) -> Action {
    if let Ok(value) = serde_json::from_str::<Value>(reply.trim()) {
        if let Some(action) = action_from_value(&value) {
            return action;
        }
        if let Some(inner) = value.get("content") {
            if let Some(action) = action_from_value(inner) {
                return action;
            }
            if let Some(text) = inner.as_str() {
                if let Ok(inner_value) = serde_json::from_str::<Value>(text) {
                    if let Some(action) = action_from_value(&inner_value) {
                        return action;
                    }
                }
            }
        }
    }

    if let Some(value) = locate_json_fragment(reply) {
        if let Some(action) = action_from_value(&value) {
            return action;
        }
    }

    let trimmed = reply.trim_start();
    if trimmed.starts_with("diff --git") || trimmed.starts_with("--- ") {
        return Action::Patch(reply.trim().to_string());
    }

    Action::Invalid
}

fn action_from_value(value: &Value) -> Option<Action> {
    let obj = value.as_object()?;
    let action = obj.get("action")?.as_str()?;
    let content = match obj.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    match action {
        "bash" => Some(Action::Bash(content)),
        "patch" => Some(Action::Patch(content)),
        "debug" => Some(Action::Debug(content)),
        _ => None,
    }
}

/// Scan for a JSON object embedded in prose. Each `{` is tried as the
/// start of a value; the stream deserializer balances braces for us and
/// ignores trailing text.
fn locate_json_fragment(reply: &str) -> Option<Value> {
    for (i, ch) in reply.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&reply[i..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.get("action").is_some() {
                return Some(value);
            }
        }
    }
    None
}

/// Which side produced a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Harness,
    Solver,
}

/// Action tag recorded on a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Bash,
    Patch,
    Debug,
    Error,
}

/// One entry of the conversation transcript.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub turn_index: u32,
    pub side: Side,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    pub content_snippet: String,
}

/// Mutable conversation state for one attempt.
#[derive(Debug, Default)]
struct Conversation {
    turns: Vec<Turn>,
    /// Completed solver rounds.
    turn: u32,
    patch_attempts: u32,
    /// Total bash stdout characters relayed to the solver; a coarse proxy
    /// for how much output the solver consumed.
    bash_stdout_chars: usize,
}

impl Conversation {
    fn record(&mut self, side: Side, action: Option<ActionKind>, content: &str) {
        let snippet: String = content.chars().take(SNIPPET_CHARS).collect();
        self.turns.push(Turn {
            turn_index: self.turns.len() as u32 + 1,
            side,
            action,
            content_snippet: snippet,
        });
    }
}

/// Terminal state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// A patch applied and the validator ran (the score may still be < 1).
    Validated,
    /// The conversation ended without an applied patch (budget exhaustion,
    /// retry exhaustion).
    NoPatch,
    /// Infrastructure failure: provisioning or solver transport.
    Error,
}

/// Immutable record of one attempt, emitted exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptResult {
    pub instance_id: String,
    pub attempt_index: u32,
    pub turns: u32,
    pub status: AttemptStatus,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    pub conversation_history: Vec<Turn>,
    pub bash_stdout_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttemptResult {
    pub fn resolved(&self) -> bool {
        self.score == 1.0
    }

    /// Record for an attempt that never got a sandbox.
    pub fn provisioning_error(task: &TaskRecord, attempt_index: u32, error: String) -> Self {
        Self {
            instance_id: task.instance_id.clone(),
            attempt_index,
            turns: 0,
            status: AttemptStatus::Error,
            score: 0.0,
            patch: None,
            validation: None,
            conversation_history: Vec::new(),
            bash_stdout_chars: 0,
            error: Some(error),
        }
    }
}

/// What the conversation loop decided, before the transcript is attached.
struct Outcome {
    status: AttemptStatus,
    score: f64,
    patch: Option<String>,
    validation: Option<ValidationSummary>,
    error: Option<String>,
}

impl Outcome {
    fn no_patch(error: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::NoPatch,
            score: 0.0,
            patch: None,
            validation: None,
            error: Some(error.into()),
        }
    }

    fn transport_error(error: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Error,
            score: 0.0,
            patch: None,
            validation: None,
            error: Some(error.into()),
        }
    }
}

/// Drives one solver conversation against one sandbox.
pub struct Orchestrator<'a, C> {
    channel: &'a C,
    config: &'a EvalConfig,
}

impl<'a, C: SolverChannel> Orchestrator<'a, C> {
    pub fn new(channel: &'a C, config: &'a EvalConfig) -> Self {
        Self { channel, config }
    }

    /// Run one attempt to completion. The sandbox is consumed and destroyed
    /// on every exit path, including transport failures and timeouts.
    pub async fn run_attempt<S: Sandbox>(
        &self,
        task: &TaskRecord,
        mut sandbox: S,
        attempt_index: u32,
    ) -> AttemptResult {
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let mut conversation = Conversation::default();

        let outcome = self
            .drive(task, &mut sandbox, &mut conversation, &conversation_id)
            .await;
        sandbox.stop().await;

        info!(
            task = %task.instance_id,
            attempt = attempt_index,
            status = ?outcome.status,
            score = outcome.score,
            turns = conversation.turn,
            "attempt finished"
        );

        AttemptResult {
            instance_id: task.instance_id.clone(),
            attempt_index,
            turns: conversation.turn,
            status: outcome.status,
            score: outcome.score,
            patch: outcome.patch,
            validation: outcome.validation,
            conversation_history: conversation.turns,
            bash_stdout_chars: conversation.bash_stdout_chars,
            error: outcome.error,
        }
    }

    async fn drive<S: Sandbox>(
        &self,
        task: &TaskRecord,
        sandbox: &mut S,
        conversation: &mut Conversation,
        conversation_id: &str,
    ) -> Outcome {
        let bash_timeout = self.config.bash_timeout();

        // The initial payload is the task, verbatim. No prompting, no
        // framing: the harness is agnostic to how the solver works.
        let mut payload = json!({
            "cwd": sandbox.cwd(),
            "problem_statement": task.problem_statement,
            "hints_text": task.hints_text,
            "python_version": sandbox.python_version(),
            "fail_to_pass": task.fail_to_pass,
        });
        let mut new_conversation = true;

        loop {
            let deadline = sandbox.started_at() + self.config.task_timeout();
            if Instant::now() >= deadline {
                return Outcome::no_patch(format!(
                    "Task timeout after {}s",
                    self.config.task_timeout
                ));
            }
            if conversation.turn >= self.config.max_turns {
                return Outcome::no_patch(format!(
                    "Max turns ({}) reached without a successful patch",
                    self.config.max_turns
                ));
            }
            conversation.turn += 1;

            let reply = match self
                .channel
                .send(conversation_id, new_conversation, &payload)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(task = %task.instance_id, error = %e, "solver messaging failed");
                    return Outcome::transport_error(format!("Solver messaging failed: {e}"));
                }
            };
            new_conversation = false;

            let action = parse_reply(&reply);
            conversation.record(Side::Solver, Some(action.kind()), &reply);
            debug!(turn = conversation.turn, action = ?action.kind(), "solver reply");

            match action {
                Action::Bash(command) => {
                    let result = sandbox.execute_bash(&command, bash_timeout).await;
                    conversation.bash_stdout_chars += result.stdout.chars().count();
                    conversation.record(Side::Harness, Some(ActionKind::Bash), &result.stdout);
                    payload = json!({
                        "cwd": result.cwd,
                        "stdout": result.stdout,
                        "stderr": result.stderr,
                    });
                }

                Action::Debug(command) => {
                    let result = sandbox.execute_debug(None, &command, bash_timeout).await;
                    conversation.record(Side::Harness, Some(ActionKind::Debug), &result.stdout);
                    payload = json!({
                        "debug_result": true,
                        "cwd": result.cwd,
                        "stdout": result.stdout,
                        "stderr": result.stderr,
                        "success": result.success,
                        "note": "Debug ran against a throwaway snapshot; no changes were kept.",
                    });
                }

                Action::Patch(patch) => {
                    let outcome = sandbox.apply_patch(&patch).await;
                    if outcome.success {
                        conversation.record(Side::Harness, Some(ActionKind::Patch), "applied");
                        let summary = Validator::default().run(&*sandbox, task).await;
                        return Outcome {
                            status: AttemptStatus::Validated,
                            score: summary.overall_score,
                            patch: Some(patch),
                            validation: Some(summary),
                            error: None,
                        };
                    }

                    conversation.record(Side::Harness, Some(ActionKind::Patch), &outcome.stderr);
                    if conversation.patch_attempts < self.config.max_patch_retries {
                        conversation.patch_attempts += 1;
                        payload = json!({
                            "patch_failed": true,
                            "cwd": sandbox.cwd(),
                            "stderr": outcome.stderr,
                            "message": "Patch failed to apply. Revise the diff and send a new patch.",
                        });
                    } else {
                        return Outcome::no_patch(format!(
                            "Patch failed to apply and no retries remain: {}",
                            outcome.stderr
                        ));
                    }
                }

                Action::Invalid => {
                    conversation.record(Side::Harness, Some(ActionKind::Error), &reply);
                    payload = json!({
                        "error": "unrecognized_reply",
                        "message": "Reply must be a JSON object of the form \
                                    {\"action\": \"bash\"|\"patch\"|\"debug\", \"content\": \"...\"}",
                        "cwd": sandbox.cwd(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sandbox::fake::{FakeBehavior, FakeSandbox};
    use crate::solver::testing::ScriptedChannel;

    const VALID_PATCH: &str = "diff --git a/src/app.py b/src/app.py\n\
                               --- a/src/app.py\n\
                               +++ b/src/app.py\n\
                               @@ -1 +1 @@\n-x\n+y\n";

    fn task_json() -> serde_json::Value {
        serde_json::json!({
            "instance_id": "someorg__somerepo-1",
            "repo": "someorg/somerepo",
            "base_commit": "0123456789abcdef",
            "problem_statement": "the widget is broken",
            "hints_text": "look at the widget",
            "fail_to_pass": ["test_widget"],
            "pass_to_pass": [],
        })
    }

    fn task() -> TaskRecord {
        serde_json::from_value(task_json()).unwrap()
    }

    fn task_with_test_patch() -> TaskRecord {
        let mut value = task_json();
        value.as_object_mut().unwrap().insert(
            "test_patch".into(),
            serde_json::json!(
                "--- a/tests/test_models.py\n+++ b/tests/test_models.py\n@@ -1 +1,2 @@\n+x\n"
            ),
        );
        serde_json::from_value(value).unwrap()
    }

    fn patch_reply(patch: &str) -> String {
        serde_json::json!({"action": "patch", "content": patch}).to_string()
    }

    // --- reply parsing ---

    #[test]
    fn parses_top_level_action() {
        assert_eq!(
            parse_reply(r#"{"action": "bash", "content": "ls -la"}"#),
            Action::Bash("ls -la".to_string())
        );
        assert_eq!(
            parse_reply(r#"{"action": "debug", "content": "pytest -x"}"#),
            Action::Debug("pytest -x".to_string())
        );
    }

    #[test]
    fn parses_nested_content_object() {
        assert_eq!(
            parse_reply(r#"{"content": {"action": "bash", "content": "pwd"}}"#),
            Action::Bash("pwd".to_string())
        );
        // content as a JSON-encoded string
        assert_eq!(
            parse_reply(r#"{"content": "{\"action\": \"bash\", \"content\": \"pwd\"}"}"#),
            Action::Bash("pwd".to_string())
        );
    }

    #[test]
    fn parses_json_fragment_in_prose() {
        let reply = r#"Sure, let me look around first.
            {"action": "bash", "content": "ls tests"}
            That should list the tests."#;
        assert_eq!(parse_reply(reply), Action::Bash("ls tests".to_string()));
    }

    #[test]
    fn parses_raw_diff_as_patch() {
        let action = parse_reply(VALID_PATCH);
        assert!(matches!(action, Action::Patch(ref p) if p.starts_with("diff --git")));

        let headers_only = "--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(matches!(parse_reply(headers_only), Action::Patch(_)));
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert_eq!(parse_reply("I will think about it."), Action::Invalid);
        assert_eq!(parse_reply(r#"{"action": "launch_missiles"}"#), Action::Invalid);
        assert_eq!(parse_reply(""), Action::Invalid);
    }

    #[test]
    fn canonical_action_round_trips() {
        let original = r#"{"action":"bash","content":"ls -la"}"#;
        let parsed = parse_reply(original);
        let reserialized = parsed.to_value().unwrap();
        assert_eq!(
            reserialized,
            serde_json::from_str::<Value>(original).unwrap()
        );
    }

    // --- conversation loop ---

    #[tokio::test]
    async fn immediate_patch_validates_and_tears_down() {
        let task = task();
        let channel = ScriptedChannel::new(vec![&patch_reply(VALID_PATCH)]);
        let config = EvalConfig::default();
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::Validated);
        assert_eq!(result.score, 1.0);
        assert!(result.resolved());
        assert_eq!(result.turns, 1);
        assert!(result.patch.is_some());
        assert!(result.validation.is_some());
        // Exactly one sandbox destroyed, exactly once.
        assert_eq!(state.lock().unwrap().stop_calls, 1);

        // The initial payload is the bare task: no prompting keys.
        let sent = channel.sent.lock().unwrap();
        let initial = sent[0].as_object().unwrap();
        let mut keys: Vec<_> = initial.keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            ["cwd", "fail_to_pass", "hints_text", "problem_statement", "python_version"]
        );
        assert_eq!(initial["problem_statement"], "the widget is broken");
    }

    #[tokio::test]
    async fn blocked_path_is_rejected_without_reaching_shell() {
        let task = task();
        let channel = ScriptedChannel::new(vec![
            r#"{"action": "bash", "content": "cat /etc/passwd"}"#,
            &patch_reply(VALID_PATCH),
        ]);
        let config = EvalConfig::default();
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        // The denial went back to the solver and the conversation continued.
        assert_eq!(result.status, AttemptStatus::Validated);
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[1]["stdout"], "");
        assert_eq!(
            sent[1]["stderr"],
            "Access denied: /etc is outside the allowed workspace"
        );
        // No shell was invoked for the blocked command.
        assert!(state.lock().unwrap().bash_log.is_empty());
    }

    #[tokio::test]
    async fn restricted_git_ref_is_rejected_without_invoking_git() {
        let task = task();
        let channel = ScriptedChannel::new(vec![
            r#"{"action": "bash", "content": "git log HEAD -n 5"}"#,
            &patch_reply(VALID_PATCH),
        ]);
        let config = EvalConfig::default();
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::Validated);
        let sent = channel.sent.lock().unwrap();
        let stderr = sent[1]["stderr"].as_str().unwrap();
        assert!(stderr.contains("HEAD"));
        assert!(stderr.contains("01234567"));
        assert!(state.lock().unwrap().bash_log.is_empty());
    }

    #[tokio::test]
    async fn protected_test_file_patch_is_rejected_with_retries_left() {
        let task = task_with_test_patch();
        let tampering = "--- a/tests/test_models.py\n+++ b/tests/test_models.py\n\
                         @@ -1 +1 @@\n-x\n+y\n";
        let channel = ScriptedChannel::new(vec![&patch_reply(tampering), &patch_reply(VALID_PATCH)]);
        let config = EvalConfig::default();
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[1]["patch_failed"], true);
        assert_eq!(
            sent[1]["stderr"],
            "Cannot modify protected test files: tests/test_models.py"
        );
        // The retry was still available and the second patch landed.
        assert_eq!(result.status, AttemptStatus::Validated);
        assert_eq!(state.lock().unwrap().patch_log.len(), 1);
    }

    #[tokio::test]
    async fn max_turns_exhaustion_ends_with_no_patch() {
        let task = task();
        let channel = ScriptedChannel::repeating(r#"{"action": "bash", "content": "ls"}"#);
        let config = EvalConfig {
            max_turns: 3,
            ..EvalConfig::default()
        };
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::NoPatch);
        assert!(result.error.as_deref().unwrap().contains("Max turns (3)"));
        assert_eq!(result.turns, 3);
        let state = state.lock().unwrap();
        assert_eq!(state.bash_log.len(), 3);
        assert_eq!(state.stop_calls, 1);
    }

    #[tokio::test]
    async fn zero_max_turns_means_zero_solver_dispatches() {
        let task = task();
        let channel = ScriptedChannel::repeating(r#"{"action": "bash", "content": "ls"}"#);
        let config = EvalConfig {
            max_turns: 0,
            ..EvalConfig::default()
        };
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::NoPatch);
        assert_eq!(result.turns, 0);
        assert!(channel.sent.lock().unwrap().is_empty());
        assert_eq!(state.lock().unwrap().stop_calls, 1);
    }

    #[tokio::test]
    async fn zero_patch_retries_means_single_failure_terminates() {
        let task = task();
        let channel = ScriptedChannel::repeating(&patch_reply(VALID_PATCH));
        let config = EvalConfig {
            max_patch_retries: 0,
            ..EvalConfig::default()
        };
        let (sandbox, _state) = FakeSandbox::new(
            &task,
            &FakeBehavior {
                patch_failures: 1,
                ..Default::default()
            },
        );

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::NoPatch);
        assert!(result.error.as_deref().unwrap().contains("no retries remain"));
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_timeout_mid_bash_ends_without_further_solver_message() {
        let task = task();
        let channel = ScriptedChannel::repeating(r#"{"action": "bash", "content": "ls"}"#);
        let config = EvalConfig {
            task_timeout: 5,
            ..EvalConfig::default()
        };
        // Each bash command "takes" 10 s, so the deadline fires at the head
        // of turn two.
        let (sandbox, state) = FakeSandbox::new(
            &task,
            &FakeBehavior {
                bash_elapsed: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        );

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::NoPatch);
        assert!(result.error.as_deref().unwrap().contains("timeout"));
        // The bash command ran and was recorded, but its result never went
        // back out.
        let state = state.lock().unwrap();
        assert_eq!(state.bash_log.len(), 1);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
        assert!(
            result
                .conversation_history
                .iter()
                .any(|t| t.side == Side::Harness && t.action == Some(ActionKind::Bash))
        );
    }

    #[tokio::test]
    async fn transport_failure_terminates_with_error() {
        let task = task();
        // Empty script: the first send fails.
        let channel = ScriptedChannel::new(vec![]);
        let config = EvalConfig::default();
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("messaging failed"));
        assert_eq!(state.lock().unwrap().stop_calls, 1);
    }

    #[tokio::test]
    async fn unrecognised_reply_respecifies_expected_shape() {
        let task = task();
        let channel = ScriptedChannel::new(vec![
            "let me ponder this for a while",
            &patch_reply(VALID_PATCH),
        ]);
        let config = EvalConfig::default();
        let (sandbox, _state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::Validated);
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[1]["error"], "unrecognized_reply");
        assert!(sent[1]["message"].as_str().unwrap().contains("\"action\""));
    }

    #[tokio::test]
    async fn turn_indices_are_strictly_increasing_and_sides_balance() {
        let task = task();
        let channel = ScriptedChannel::new(vec![
            r#"{"action": "bash", "content": "ls"}"#,
            r#"{"action": "debug", "content": "pytest -x"}"#,
            &patch_reply(VALID_PATCH),
        ]);
        let config = EvalConfig::default();
        let (sandbox, _state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        let history = &result.conversation_history;
        for (i, turn) in history.iter().enumerate() {
            assert_eq!(turn.turn_index, i as u32 + 1);
        }
        let solver_turns = history.iter().filter(|t| t.side == Side::Solver).count();
        let harness_turns = history.iter().filter(|t| t.side == Side::Harness).count();
        assert_eq!(solver_turns, harness_turns);
        assert_eq!(solver_turns, 3);
    }

    #[tokio::test]
    async fn debug_response_carries_snapshot_note() {
        let task = task();
        let channel = ScriptedChannel::new(vec![
            r#"{"action": "debug", "content": "pytest tests -x"}"#,
            &patch_reply(VALID_PATCH),
        ]);
        let config = EvalConfig::default();
        let (sandbox, state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        assert_eq!(result.status, AttemptStatus::Validated);
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[1]["debug_result"], true);
        assert_eq!(sent[1]["success"], true);
        assert!(sent[1]["note"].as_str().unwrap().contains("snapshot"));
        assert_eq!(state.lock().unwrap().debug_log.len(), 1);
    }

    #[tokio::test]
    async fn bash_stdout_chars_accumulate() {
        let task = task();
        let channel = ScriptedChannel::new(vec![
            r#"{"action": "bash", "content": "ls"}"#,
            r#"{"action": "bash", "content": "pwd"}"#,
            &patch_reply(VALID_PATCH),
        ]);
        let config = EvalConfig::default();
        let (sandbox, _state) = FakeSandbox::new(&task, &FakeBehavior::default());

        let result = Orchestrator::new(&channel, &config)
            .run_attempt(&task, sandbox, 1)
            .await;

        // The fake answers every bash command with "ok\n" (3 chars).
        assert_eq!(result.bash_stdout_chars, 6);
    }
}
