//! Task records for the benchmark corpus.
//!
//! A [`TaskRecord`] describes one real-world defect: a repository snapshot,
//! a natural-language problem statement, and the tests that decide whether
//! a proposed fix is correct. Records are immutable inputs; the harness
//! never mutates them.
//!
//! The upstream corpus ships with a few encoding quirks that this module
//! absorbs at the deserialization boundary: the test lists arrive either as
//! real JSON arrays or as JSON-encoded strings (`"[\"test_a\"]"`), and the
//! field names come in upper-case variants (`FAIL_TO_PASS`). Everything
//! downstream sees plain `Vec<String>`.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// One defect instance: repository snapshot + problem statement + judgement tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier, e.g. `django__django-11099`.
    pub instance_id: String,

    /// Source repository coordinate, e.g. `django/django`.
    pub repo: String,

    /// Pre-fix state the solver works against.
    pub base_commit: String,

    /// Commit from which dependency manifests are extracted.
    ///
    /// Falls back to `base_commit` when the corpus leaves it empty.
    #[serde(default)]
    pub environment_setup_commit: String,

    /// Natural-language description of the defect.
    pub problem_statement: String,

    /// Optional extra hints shipped with the task.
    #[serde(default)]
    pub hints_text: String,

    /// Unified diff that installs/modifies the judgement test files.
    ///
    /// Files touched by this diff become the protected set: the solver may
    /// never modify them.
    #[serde(default)]
    pub test_patch: String,

    /// Reference fix. Unused during evaluation; exercised by the gold-patch
    /// self-test only.
    #[serde(default, alias = "patch")]
    pub gold_patch: String,

    /// Tests that must transition from failing to passing.
    #[serde(
        default,
        alias = "FAIL_TO_PASS",
        deserialize_with = "string_or_seq"
    )]
    pub fail_to_pass: Vec<String>,

    /// Tests that must remain passing.
    #[serde(
        default,
        alias = "PASS_TO_PASS",
        deserialize_with = "string_or_seq"
    )]
    pub pass_to_pass: Vec<String>,

    /// Project version tag, e.g. `3.0`; drives runtime and command selection.
    #[serde(default)]
    pub version: String,

    /// Difficulty tag from the corpus.
    #[serde(default)]
    pub difficulty: String,
}

impl TaskRecord {
    /// The commit dependency manifests are read from.
    pub fn setup_commit(&self) -> &str {
        if self.environment_setup_commit.is_empty() {
            &self.base_commit
        } else {
            &self.environment_setup_commit
        }
    }

    /// Total number of judgement tests.
    pub fn total_tests(&self) -> usize {
        self.fail_to_pass.len() + self.pass_to_pass.len()
    }
}

/// Accept either a JSON array of strings or a JSON-encoded string holding one.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seq(Vec<String>),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seq(v) => Ok(v),
        Raw::Text(s) if s.trim().is_empty() => Ok(Vec::new()),
        Raw::Text(s) => serde_json::from_str(&s)
            .map_err(|e| de::Error::custom(format!("invalid test list {s:?}: {e}"))),
    }
}
