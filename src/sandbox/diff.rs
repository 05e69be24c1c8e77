//! Unified-diff header parsing.
//!
//! The sandbox only needs one fact from a patch: which files it touches.
//! That drives both the protected-set computation when the task's test
//! patch is installed and the rejection of solver patches that reach for
//! protected files.

use std::sync::OnceLock;

use regex::Regex;

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\+\+\+ (?:b/)?(.+)$").unwrap())
}

/// Extract the target file paths from a unified diff's `+++` headers.
///
/// Strips the conventional `b/` prefix and ignores `/dev/null` (file
/// deletions have no target to protect).
pub fn patch_files(patch: &str) -> Vec<String> {
    header_re()
        .captures_iter(patch)
        .filter_map(|cap| {
            let path = cap[1].trim();
            (!path.is_empty() && path != "/dev/null").then(|| path.to_string())
        })
        .collect()
}

/// Files from `patch` that are in the protected set.
pub fn protected_violations(patch: &str, protected: &[String]) -> Vec<String> {
    patch_files(patch)
        .into_iter()
        .filter(|f| protected.iter().any(|p| p == f))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "\
diff --git a/src/app.py b/src/app.py
--- a/src/app.py
+++ b/src/app.py
@@ -1,3 +1,4 @@
+import os
diff --git a/tests/test_models.py b/tests/test_models.py
--- a/tests/test_models.py
+++ b/tests/test_models.py
@@ -10,2 +10,3 @@
+    assert True
";

    #[test]
    fn extracts_target_paths() {
        assert_eq!(patch_files(PATCH), vec!["src/app.py", "tests/test_models.py"]);
    }

    #[test]
    fn skips_dev_null_and_bare_prefix() {
        let patch = "\
--- a/gone.py
+++ /dev/null
@@ -1 +0,0 @@
-x = 1
--- a/kept.py
+++ kept.py
@@ -1 +1 @@
-x
+y
";
        assert_eq!(patch_files(patch), vec!["kept.py"]);
    }

    #[test]
    fn empty_patch_has_no_files() {
        assert!(patch_files("").is_empty());
        assert!(patch_files("not a diff at all").is_empty());
    }

    #[test]
    fn detects_protected_intersection() {
        let protected = vec!["tests/test_models.py".to_string()];
        assert_eq!(
            protected_violations(PATCH, &protected),
            vec!["tests/test_models.py"]
        );
        assert!(protected_violations(PATCH, &["other.py".to_string()]).is_empty());
    }
}
