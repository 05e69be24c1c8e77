//! Test execution and scoring inside a provisioned sandbox.
//!
//! The benchmark identifies tests in two canonical forms: a class-qualified
//! method (`test_method (dotted.module.ClassName)`) or a bare method name
//! (`test_foo`). Each `(repo, version)` pair maps to the command template
//! its project actually needs — Django's own runner, SymPy's `bin/test`,
//! Sphinx through tox, plain pytest for the rest — so command selection is
//! deterministic given the task record.
//!
//! Tests run serially, `fail_to_pass` before `pass_to_pass`, inside the
//! *existing* sandbox: the validator never provisions anything and never
//! mutates files. A non-zero exit (including a timeout) is a failed test,
//! not a harness error.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::config::DEFAULT_TEST_TIMEOUT_SECS;
use crate::sandbox::Sandbox;
use crate::task::TaskRecord;

/// Characters of combined output retained per test.
const OUTPUT_TAIL_CHARS: usize = 2_000;

fn qualified_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)\s+\(([^)]+)\)$").unwrap())
}

fn bare_method_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^test_\w+$").unwrap())
}

/// `test_method (dotted.module.ClassName)` → `dotted.module.ClassName.test_method`.
///
/// This is the selector format Django's `runtests.py` expects.
pub fn to_django_selector(test: &str) -> String {
    match qualified_re().captures(test.trim()) {
        Some(cap) => format!("{}.{}", &cap[2], &cap[1]),
        None => test.trim().to_string(),
    }
}

/// `test_method (dotted.module.ClassName)` → `dotted/module.py::ClassName::test_method`.
pub fn to_pytest_selector(test: &str) -> String {
    let trimmed = test.trim();
    let Some(cap) = qualified_re().captures(trimmed) else {
        return trimmed.to_string();
    };
    let method = &cap[1];
    let path = &cap[2];
    match path.rsplit_once('.') {
        Some((module, class)) => {
            let filepath = module.replace('.', "/");
            format!("{filepath}.py::{class}::{method}")
        }
        None => trimmed.to_string(),
    }
}

/// Is this a bare method name with no module information?
pub fn is_bare_method(test: &str) -> bool {
    bare_method_re().is_match(test.trim())
}

/// The concrete command that runs one test for `(repo, version)`.
///
/// Deterministic: the same inputs always produce the same command string.
pub fn test_command(repo: &str, version: &str, test: &str) -> String {
    let python = "python";

    match repo {
        "django/django" => {
            let selector = to_django_selector(test);
            if version.trim() == "1.9" {
                format!("{python} tests/runtests.py {selector} -v 2")
            } else {
                format!(
                    "{python} tests/runtests.py --settings=test_sqlite --parallel 1 {selector} -v 2"
                )
            }
        }
        "sympy/sympy" => format!(
            "PYTHONWARNINGS='ignore::UserWarning,ignore::SyntaxWarning' \
             bin/test -C --verbose {test}"
        ),
        "sphinx-doc/sphinx" => {
            let selector = to_pytest_selector(test);
            format!("tox --current-env -epy39 -v -- {selector}")
        }
        "astropy/astropy" => {
            let selector = to_pytest_selector(test);
            format!(
                "{python} -m pytest -rA -vv -o console_output_style=classic --tb=short {selector}"
            )
        }
        "matplotlib/matplotlib"
        | "scikit-learn/scikit-learn"
        | "pallets/flask"
        | "pydata/xarray"
        | "pytest-dev/pytest"
        | "psf/requests"
        | "pylint-dev/pylint" => {
            let selector = to_pytest_selector(test);
            format!("{python} -m pytest -rA -xvs --tb=short {selector}")
        }
        "mwaskom/seaborn" => {
            let selector = to_pytest_selector(test);
            format!("{python} -m pytest --no-header -rA -xvs --tb=short {selector}")
        }
        _ => {
            if is_bare_method(test) {
                format!("{python} -m pytest -k {} -xvs --tb=short", test.trim())
            } else {
                let selector = to_pytest_selector(test);
                format!("{python} -m pytest {selector} -xvs --tb=short")
            }
        }
    }
}

/// Outcome of one required test.
#[derive(Debug, Clone, Serialize)]
pub struct TestCheck {
    pub name: String,
    pub passed: bool,
    pub output_tail: String,
}

/// Per-group outcomes and derived scores for one validation run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub fail_to_pass: Vec<TestCheck>,
    pub pass_to_pass: Vec<TestCheck>,
    pub f2p_passed: usize,
    pub f2p_total: usize,
    pub p2p_passed: usize,
    pub p2p_total: usize,
    pub f2p_score: f64,
    pub p2p_score: f64,
    pub overall_score: f64,
}

impl ValidationSummary {
    pub fn new(fail_to_pass: Vec<TestCheck>, pass_to_pass: Vec<TestCheck>) -> Self {
        let f2p_total = fail_to_pass.len();
        let p2p_total = pass_to_pass.len();
        let f2p_passed = fail_to_pass.iter().filter(|t| t.passed).count();
        let p2p_passed = pass_to_pass.iter().filter(|t| t.passed).count();
        let total = f2p_total + p2p_total;

        Self {
            fail_to_pass,
            pass_to_pass,
            f2p_passed,
            f2p_total,
            p2p_passed,
            p2p_total,
            f2p_score: ratio(f2p_passed, f2p_total),
            p2p_score: ratio(p2p_passed, p2p_total),
            overall_score: ratio(f2p_passed + p2p_passed, total),
        }
    }

    /// A task is resolved iff every required test passes.
    pub fn resolved(&self) -> bool {
        self.f2p_total + self.p2p_total > 0 && self.overall_score == 1.0
    }

    pub fn tests_passed(&self) -> usize {
        self.f2p_passed + self.p2p_passed
    }

    pub fn tests_failed(&self) -> usize {
        (self.f2p_total - self.f2p_passed) + (self.p2p_total - self.p2p_passed)
    }
}

fn ratio(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}

/// Runs a task's required tests inside an existing sandbox and scores them.
pub struct Validator {
    test_timeout: Duration,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS),
        }
    }
}

impl Validator {
    pub fn new(test_timeout: Duration) -> Self {
        Self { test_timeout }
    }

    /// Run `fail_to_pass` then `pass_to_pass`, serially and in order, and
    /// return the scored summary.
    pub async fn run<S: Sandbox>(&self, sandbox: &S, task: &TaskRecord) -> ValidationSummary {
        let fail_to_pass = self.run_group(sandbox, task, &task.fail_to_pass).await;
        let pass_to_pass = self.run_group(sandbox, task, &task.pass_to_pass).await;
        let summary = ValidationSummary::new(fail_to_pass, pass_to_pass);
        debug!(
            task = %task.instance_id,
            f2p = format!("{}/{}", summary.f2p_passed, summary.f2p_total),
            p2p = format!("{}/{}", summary.p2p_passed, summary.p2p_total),
            overall = summary.overall_score,
            "validation complete"
        );
        summary
    }

    async fn run_group<S: Sandbox>(
        &self,
        sandbox: &S,
        task: &TaskRecord,
        tests: &[String],
    ) -> Vec<TestCheck> {
        let mut checks = Vec::with_capacity(tests.len());
        for test in tests {
            let command = test_command(&task.repo, &task.version, test);
            let result = sandbox.run_command(&command, self.test_timeout).await;
            let combined = format!("{}{}", result.stdout, result.stderr);
            checks.push(TestCheck {
                name: test.clone(),
                passed: result.success,
                output_tail: tail(&combined, OUTPUT_TAIL_CHARS),
            });
        }
        checks
    }
}

/// Last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(count - max_chars).collect()
    }
}
