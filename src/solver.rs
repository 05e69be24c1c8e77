//! Solver messaging channel.
//!
//! The harness treats the solver as an opaque JSON-text endpoint: each call
//! carries either the initial task payload (opening a conversation) or a
//! follow-up payload, and the reply is raw text that the orchestrator
//! interprets. Nothing here knows what a solver is made of.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::DEFAULT_SOLVER_TIMEOUT_SECS;
use crate::task::TaskRecord;

/// Errors on the solver transport. Any of these terminates the attempt.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("Solver transport error: {0}")]
    Transport(String),

    #[error("Solver request timed out after {0}s")]
    Timeout(u64),
}

/// Opaque bidirectional JSON text transport to a solver agent.
///
/// Implementations must be cheap to call repeatedly; one conversation maps
/// to one `conversation_id`, generated by the orchestrator per attempt.
#[async_trait]
pub trait SolverChannel: Send + Sync {
    /// Send `payload` and return the solver's raw reply text.
    ///
    /// `new_conversation` is `true` exactly once per attempt, on the
    /// initial task payload.
    async fn send(
        &self,
        conversation_id: &str,
        new_conversation: bool,
        payload: &Value,
    ) -> Result<String, SolverError>;
}

/// HTTP implementation of [`SolverChannel`].
///
/// Posts `{"message": <payload as text>, "context_id": <conversation_id>}`
/// to the solver endpoint and returns the reply body. A `{"response": ...}`
/// wrapper is unwrapped when present; anything else is passed through
/// verbatim for the orchestrator's forgiving parser.
pub struct HttpSolverChannel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSolverChannel {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SolverError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_SOLVER_TIMEOUT_SECS))
            .build()
            .map_err(|e| SolverError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl SolverChannel for HttpSolverChannel {
    async fn send(
        &self,
        conversation_id: &str,
        new_conversation: bool,
        payload: &Value,
    ) -> Result<String, SolverError> {
        #[derive(Deserialize)]
        struct Wrapped {
            response: String,
        }

        let body = serde_json::json!({
            "message": payload.to_string(),
            "context_id": conversation_id,
            "new_conversation": new_conversation,
        });

        let response = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SolverError::Timeout(DEFAULT_SOLVER_TIMEOUT_SECS)
                } else {
                    SolverError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SolverError::Transport(format!(
                "solver returned HTTP {status}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| SolverError::Transport(e.to_string()))?;

        match serde_json::from_str::<Wrapped>(&text) {
            Ok(wrapped) => Ok(wrapped.response),
            Err(_) => Ok(text),
        }
    }
}

/// A built-in channel that answers every conversation with the task's
/// reference patch. Used by the `self-test` command to exercise the whole
/// pipeline without an external solver.
pub struct GoldPatchChannel {
    patch: String,
}

impl GoldPatchChannel {
    pub fn for_task(task: &TaskRecord) -> Self {
        Self {
            patch: task.gold_patch.clone(),
        }
    }
}

#[async_trait]
impl SolverChannel for GoldPatchChannel {
    async fn send(
        &self,
        _conversation_id: &str,
        _new_conversation: bool,
        _payload: &Value,
    ) -> Result<String, SolverError> {
        Ok(serde_json::json!({
            "action": "patch",
            "content": self.patch,
        })
        .to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gold_patch_channel_replies_with_patch_action() {
        let task: TaskRecord = serde_json::from_value(serde_json::json!({
            "instance_id": "x__x-1",
            "repo": "x/x",
            "base_commit": "c",
            "problem_statement": "p",
            "patch": "diff --git a/f b/f\n--- a/f\n+++ b/f\n",
        }))
        .unwrap();

        let channel = GoldPatchChannel::for_task(&task);
        let reply = channel
            .send("conv-1", true, &serde_json::json!({}))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["action"], "patch");
        assert!(value["content"].as_str().unwrap().starts_with("diff --git"));
    }
}
