//! Command policy checks for solver bash execution.
//!
//! Three independent policies gate every solver command before it reaches a
//! shell:
//!
//! 1. **Blocked system paths** — commands referencing `/etc`, `/proc` and
//!    friends are rejected up front. Matching is token-based: the command
//!    line is split with shell-aware parsing and a blocked prefix must
//!    cover a whole path token, so `pytest` does not trip over `/tmp`
//!    being a substring of something. When the command line cannot be
//!    parsed at all we fall back to a conservative substring probe.
//! 2. **Restricted VCS references** — the repository is checked out at
//!    `base_commit` and its future (containing the real fix) must stay
//!    invisible. `log`/`show`/`diff`/`checkout` with symbolic refs are
//!    rejected, as are `reset`, `pull`, `fetch` and a bare `show`.
//! 3. **Working-directory boundary** — `cd` targets resolve against the
//!    current directory, normalise lexically, and may not escape the repo
//!    root.
//!
//! All checks are pure functions; the sandbox applies them before any
//! subprocess is spawned.

/// System paths a solver command may never reference.
pub const BLOCKED_PATHS: &[&str] = &[
    "/tmp",
    "/var/tmp",
    "/etc",
    "/root",
    "/home",
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/var/log",
];

/// Symbolic references that could reveal commits after `base_commit`.
pub const BLOCKED_REFS: &[&str] = &[
    "HEAD",
    "main",
    "master",
    "origin/main",
    "origin/master",
    "origin/HEAD",
];

/// Returns the blocked system path a command references, if any.
pub fn blocked_path(command: &str) -> Option<&'static str> {
    let tokens = match shell_words::split(command) {
        Ok(tokens) => tokens,
        // Unbalanced quotes etc.: be conservative, fall back to substrings.
        Err(_) => {
            return BLOCKED_PATHS
                .iter()
                .find(|blocked| command.contains(*blocked))
                .copied();
        }
    };

    for token in &tokens {
        // Redirect operators may be glued to their target (`>/tmp/x`,
        // `2>/dev/null`).
        let path = token
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .trim_start_matches(['>', '<', '&']);
        for blocked in BLOCKED_PATHS {
            if path == *blocked || path.starts_with(&format!("{blocked}/")) {
                return Some(blocked);
            }
        }
    }
    None
}

/// Returns a rejection message if the command is a restricted VCS operation.
///
/// The message names the offending reference and points the solver at
/// `base_commit`, which is always safe to inspect.
pub fn vcs_restriction(command: &str, base_commit: &str) -> Option<String> {
    let tokens: Vec<String> = shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(str::to_string).collect());

    let short = &base_commit[..base_commit.len().min(8)];

    for (i, token) in tokens.iter().enumerate() {
        if token != "git" {
            continue;
        }
        let Some(subcommand) = tokens.get(i + 1) else {
            continue;
        };
        let rest = &tokens[i + 2..];

        match subcommand.as_str() {
            "reset" => return Some("git reset is restricted.".to_string()),
            "pull" | "fetch" => {
                return Some(
                    "git pull/fetch is restricted. The repo is in a fixed state.".to_string(),
                );
            }
            "show" if !rest.iter().any(|t| !t.starts_with('-')) => {
                // Bare `git show` defaults to HEAD.
                return Some(format!(
                    "git show without arguments is restricted. Use 'git show <commit-hash>' \
                     for commits at or before {short}."
                ));
            }
            "log" | "show" | "diff" | "checkout" => {
                if let Some(found) = rest.iter().find_map(|t| matched_ref(t)) {
                    return Some(format!(
                        "git {subcommand} with '{found}' is restricted. Use specific commit \
                         hashes at or before {short}."
                    ));
                }
            }
            _ => {}
        }
    }
    None
}

/// Matches a token against the blocked reference set, including suffixed
/// forms like `HEAD~1`, `HEAD^` or `main:path`.
fn matched_ref(token: &str) -> Option<&'static str> {
    BLOCKED_REFS.iter().copied().find(|r| {
        token == *r
            || token
                .strip_prefix(r)
                .is_some_and(|rest| rest.starts_with(['~', '^', ':', '@']))
    })
}

/// Lexically normalise a path: collapse `.`, apply `..` without touching
/// the filesystem.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    if absolute {
        format!("/{}", parts.join("/"))
    } else {
        parts.join("/")
    }
}

/// Resolve a `cd` target against the current working directory.
pub fn resolve_path(cwd: &str, target: &str) -> String {
    if target.starts_with('/') {
        normalize(target)
    } else {
        normalize(&format!("{cwd}/{target}"))
    }
}

/// Is `path` the repo root or a descendant of it?
pub fn is_within_repo(path: &str, repo_root: &str) -> bool {
    let normalized = normalize(path);
    normalized == repo_root || normalized.starts_with(&format!("{repo_root}/"))
}

/// Does the command chain multiple expressions (`&&`, `;`)?
///
/// Compound commands can change the shell's working directory as a side
/// effect, so the sandbox re-queries `pwd` after running them.
pub fn is_compound(command: &str) -> bool {
    command.contains("&&") || command.contains(';')
}
