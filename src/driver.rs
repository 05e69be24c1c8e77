//! Evaluation driver: iterate tasks × attempts, collect attempt records.
//!
//! The driver is strictly sequential — one sandbox, one conversation, one
//! validator run at a time — which keeps host resource usage bounded and
//! the logs coherent. A failing attempt never aborts the run: whatever
//! happens, each (task, attempt) pair contributes exactly one record to
//! the final report.

use tracing::{info, warn};

use crate::config::EvalConfig;
use crate::orchestrator::{AttemptResult, Orchestrator};
use crate::registry::TaskRegistry;
use crate::report::EvalReport;
use crate::sandbox::SandboxProvider;
use crate::solver::SolverChannel;
use crate::task::TaskRecord;

/// Runs a full evaluation: task selection, attempts, aggregation.
pub struct EvalDriver<'a, P> {
    provider: &'a P,
    config: EvalConfig,
}

impl<'a, P: SandboxProvider> EvalDriver<'a, P> {
    pub fn new(provider: &'a P, config: EvalConfig) -> Self {
        Self { provider, config }
    }

    /// Select tasks from the registry per the request filters and evaluate
    /// them.
    pub async fn run<C: SolverChannel>(&self, registry: &TaskRegistry, channel: &C) -> EvalReport {
        let tasks = registry.select(&self.config);
        if tasks.is_empty() {
            warn!("task selection is empty; nothing to evaluate");
        }
        self.run_tasks(&tasks, channel).await
    }

    /// Evaluate an explicit task selection: `max_attempts` independent
    /// attempts per task, each with a fresh sandbox and conversation.
    pub async fn run_tasks<C: SolverChannel>(
        &self,
        tasks: &[&TaskRecord],
        channel: &C,
    ) -> EvalReport {
        let mut results = Vec::with_capacity(tasks.len() * self.config.max_attempts as usize);

        for task in tasks {
            info!(task = %task.instance_id, repo = %task.repo, "evaluating task");
            for attempt_index in 1..=self.config.max_attempts {
                let result = self.run_attempt(task, attempt_index, channel).await;
                results.push(result);
            }
        }

        EvalReport::from_attempts(tasks.len(), self.config.max_attempts, results)
    }

    async fn run_attempt<C: SolverChannel>(
        &self,
        task: &TaskRecord,
        attempt_index: u32,
        channel: &C,
    ) -> AttemptResult {
        match self.provider.provision(task).await {
            Ok(sandbox) => {
                Orchestrator::new(channel, &self.config)
                    .run_attempt(task, sandbox, attempt_index)
                    .await
            }
            Err(e) => {
                warn!(
                    task = %task.instance_id,
                    attempt = attempt_index,
                    error = %e,
                    "sandbox provisioning failed"
                );
                AttemptResult::provisioning_error(task, attempt_index, e.to_string())
            }
        }
    }
}
