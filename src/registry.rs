//! In-memory access to the benchmark corpus.
//!
//! The registry is a read-only view over loaded [`TaskRecord`]s with the
//! handful of filters the evaluation driver composes: a direct id lookup,
//! repository and difficulty filters, and a `max_tasks` cap. Loading the
//! corpus from wherever it lives (a dataset export, a fixture file) happens
//! once, up front; the registry itself never touches the filesystem after
//! construction except through [`TaskRegistry::from_json_file`].

use std::path::Path;

use serde::Deserialize;

use crate::config::EvalConfig;
use crate::task::TaskRecord;

/// Read-only task corpus with filter accessors.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskRecord>,
}

impl TaskRegistry {
    /// Build a registry from already-loaded records.
    pub fn new(tasks: Vec<TaskRecord>) -> Self {
        Self { tasks }
    }

    /// Load a registry from a JSON file holding an array of task records.
    ///
    /// Accepts both the plain-array export and the `{"tasks": [...]}`
    /// wrapper some corpus dumps use.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Corpus {
            Plain(Vec<TaskRecord>),
            Wrapped { tasks: Vec<TaskRecord> },
        }

        let text = std::fs::read_to_string(path)?;
        let corpus: Corpus = serde_json::from_str(&text)?;
        let tasks = match corpus {
            Corpus::Plain(tasks) => tasks,
            Corpus::Wrapped { tasks } => tasks,
        };
        tracing::info!(count = tasks.len(), path = %path.display(), "loaded task corpus");
        Ok(Self::new(tasks))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Look up a single task by `instance_id`.
    pub fn get_by_id(&self, instance_id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.instance_id == instance_id)
    }

    /// Iterate over every task in corpus order.
    pub fn iter_all(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter()
    }

    /// All tasks from one repository.
    pub fn get_by_repo(&self, repo: &str) -> Vec<&TaskRecord> {
        self.tasks.iter().filter(|t| t.repo == repo).collect()
    }

    /// All tasks with a given difficulty tag.
    pub fn get_by_difficulty(&self, difficulty: &str) -> Vec<&TaskRecord> {
        self.tasks
            .iter()
            .filter(|t| t.difficulty == difficulty)
            .collect()
    }

    /// Compose the request filters into a concrete task selection.
    ///
    /// An `instance_id` filter short-circuits to that single task. Otherwise
    /// `repo` and `difficulty` are AND-combined and the result is truncated
    /// to `max_tasks`.
    pub fn select(&self, config: &EvalConfig) -> Vec<&TaskRecord> {
        if let Some(id) = &config.instance_id {
            return self.get_by_id(id).into_iter().collect();
        }

        let mut selected: Vec<&TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| config.repo.as_deref().is_none_or(|r| t.repo == r))
            .filter(|t| {
                config
                    .difficulty
                    .as_deref()
                    .is_none_or(|d| t.difficulty == d)
            })
            .collect();

        if let Some(cap) = config.max_tasks {
            selected.truncate(cap);
        }
        selected
    }
}
