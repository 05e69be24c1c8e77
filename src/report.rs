//! Result aggregation and artifact emission.
//!
//! One evaluation run produces a single [`EvalReport`]: per-attempt records
//! plus the aggregates the benchmark cares about — pass@k over the first
//! `j` attempts per instance, best-of-k scores, and totals. The report
//! serializes to the structured JSON artifact and renders a human text
//! summary; it never mutates anything.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::orchestrator::{AttemptResult, AttemptStatus};

/// Aggregated outcome of one evaluation run.
#[derive(Debug, Serialize)]
pub struct EvalReport {
    pub total_tasks: usize,
    pub validated: usize,
    pub no_patch: usize,
    pub errors: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub average_best_of_k_score: f64,
    pub average_turns: f64,
    /// Instances resolved by at least one of their attempts.
    pub resolved: usize,
    pub resolve_rate: f64,
    /// `pass@j` for `j = 1..=max_attempts`: the fraction of instances whose
    /// first `j` attempts contain at least one fully-resolved result.
    pub pass_at_k: BTreeMap<String, f64>,
    pub max_attempts: u32,
    pub avg_bash_stdout_chars: f64,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub results: Vec<AttemptResult>,
}

impl EvalReport {
    /// Fold per-attempt records into the aggregate report.
    ///
    /// `results` holds every attempt of every instance; attempts of one
    /// instance share its `instance_id` and are ordered by `attempt_index`.
    pub fn from_attempts(
        total_tasks: usize,
        max_attempts: u32,
        results: Vec<AttemptResult>,
    ) -> Self {
        // Group attempts per instance, preserving first-seen order.
        let mut instances: Vec<(&str, Vec<&AttemptResult>)> = Vec::new();
        for result in &results {
            match instances.iter_mut().find(|(id, _)| *id == result.instance_id) {
                Some((_, attempts)) => attempts.push(result),
                None => instances.push((&result.instance_id, vec![result])),
            }
        }
        for (_, attempts) in &mut instances {
            attempts.sort_by_key(|a| a.attempt_index);
        }

        let validated = count_status(&results, AttemptStatus::Validated);
        let no_patch = count_status(&results, AttemptStatus::NoPatch);
        let errors = count_status(&results, AttemptStatus::Error);

        let tests_passed = results
            .iter()
            .filter_map(|r| r.validation.as_ref())
            .map(|v| v.tests_passed())
            .sum();
        let tests_failed = results
            .iter()
            .filter_map(|r| r.validation.as_ref())
            .map(|v| v.tests_failed())
            .sum();

        let best_scores: Vec<f64> = instances
            .iter()
            .map(|(_, attempts)| {
                attempts
                    .iter()
                    .map(|a| a.score)
                    .fold(0.0_f64, f64::max)
            })
            .collect();
        let resolved = instances
            .iter()
            .filter(|(_, attempts)| attempts.iter().any(|a| a.resolved()))
            .count();

        let mut pass_at_k = BTreeMap::new();
        for j in 1..=max_attempts {
            pass_at_k.insert(format!("pass@{j}"), pass_at(&instances, j));
        }

        Self {
            total_tasks,
            validated,
            no_patch,
            errors,
            tests_passed,
            tests_failed,
            average_best_of_k_score: mean(&best_scores),
            average_turns: mean_by(&results, |r| r.turns as f64),
            resolved,
            resolve_rate: ratio(resolved, total_tasks),
            pass_at_k,
            max_attempts,
            avg_bash_stdout_chars: mean_by(&results, |r| r.bash_stdout_chars as f64),
            generated_at: chrono::Utc::now(),
            results,
        }
    }

    /// Write the structured artifact as pretty-printed JSON.
    pub fn write_artifact(&self, path: &std::path::Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Human-readable run summary.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Evaluated {} task(s) with up to {} attempt(s) each: \
             {} resolved ({:.0}%)\n",
            self.total_tasks,
            self.max_attempts,
            self.resolved,
            self.resolve_rate * 100.0
        ));
        out.push_str(&format!(
            "Attempts: {} validated, {} no_patch, {} error\n",
            self.validated, self.no_patch, self.errors
        ));
        out.push_str(&format!(
            "Tests: {} passed, {} failed | best-of-k score {:.3} | avg turns {:.1}\n",
            self.tests_passed, self.tests_failed, self.average_best_of_k_score, self.average_turns
        ));
        for (key, value) in &self.pass_at_k {
            out.push_str(&format!("{key}: {value:.3}\n"));
        }
        out
    }
}

/// Fraction of instances whose first `j` attempts contain a resolved one.
fn pass_at(instances: &[(&str, Vec<&AttemptResult>)], j: u32) -> f64 {
    if instances.is_empty() {
        return 0.0;
    }
    let hits = instances
        .iter()
        .filter(|(_, attempts)| {
            attempts
                .iter()
                .take(j as usize)
                .any(|a| a.resolved())
        })
        .count();
    hits as f64 / instances.len() as f64
}

fn count_status(results: &[AttemptResult], status: AttemptStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn mean_by(results: &[AttemptResult], f: impl Fn(&AttemptResult) -> f64) -> f64 {
    if results.is_empty() {
        0.0
    } else {
        results.iter().map(f).sum::<f64>() / results.len() as f64
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
