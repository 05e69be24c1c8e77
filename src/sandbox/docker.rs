//! Docker-backed sandbox implementation.
//!
//! One long-running container per task attempt, provisioned through the
//! fixed sequence described on [`DockerProvider::provision`]. The repo tree
//! inside the container spends its whole life read-only; the only writes
//! happen in the narrow window [`DockerSandbox::apply_patch`] opens, and
//! debug runs happen against a committed snapshot that is destroyed on
//! return.
//!
//! Container and image names carry a random suffix so concurrent
//! evaluations on the same Docker host never collide, and removal is
//! always forced rather than left to image eviction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CommitContainerOptions, RemoveImageOptions};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    AGENT_SCRATCH_DIR, BashResult, ENV_MANIFEST_DIR, MAX_STDERR_BYTES, MAX_STDOUT_BYTES,
    PatchOutcome, REPO_ROOT, Sandbox, SandboxError, SandboxProvider, SandboxResult,
    SandboxStatusSnapshot, diff, policy, truncate_bytes,
};
use crate::config::DEFAULT_TEST_TIMEOUT_SECS;
use crate::runtime;
use crate::task::TaskRecord;
use crate::validator;

/// Base image name; tagged with the provisioned Python version.
const IMAGE_NAME: &str = "fixbench-env";

/// Canonical Dockerfile for the base image, shipped inside the binary.
const DOCKERFILE: &str = include_str!("../../docker/Dockerfile");

const MEMORY_LIMIT_BYTES: i64 = 4 * 1024 * 1024 * 1024;
const CPU_LIMIT: f64 = 2.0;

const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const APPLY_TIMEOUT: Duration = Duration::from_secs(60);
const CHMOD_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dependency manifests extracted at `environment_setup_commit`.
const MANIFEST_FILES: &[&str] = &[
    "requirements.txt",
    "requirements-dev.txt",
    "test-requirements.txt",
    "requirements_dev.txt",
    "environment.yml",
    "environment.yaml",
];

/// Manifests pip can install directly (the conda ones are staged only).
const PIP_MANIFESTS: &[&str] = &[
    "requirements.txt",
    "requirements-dev.txt",
    "test-requirements.txt",
    "requirements_dev.txt",
];

/// Provisions Docker-backed sandboxes, one per task attempt.
pub struct DockerProvider {
    docker: Docker,
    image_name: String,
}

impl DockerProvider {
    /// Connect to the local Docker daemon.
    pub fn new() -> SandboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            image_name: IMAGE_NAME.to_string(),
        })
    }

    /// Ensure the base image for `python_version` exists, building it from
    /// the bundled Dockerfile when absent.
    async fn ensure_image(&self, python_version: &str) -> SandboxResult<String> {
        let tag = format!("{}:{}", self.image_name, python_version);

        if self.docker.inspect_image(&tag).await.is_ok() {
            debug!(image = %tag, "base image present");
            return Ok(tag);
        }

        info!(image = %tag, "building base image");
        let context = tar_single_file("Dockerfile", DOCKERFILE.as_bytes())
            .map_err(|e| SandboxError::ImageBuild(e.to_string()))?;

        let mut buildargs = HashMap::new();
        buildargs.insert("PYTHON_VERSION".to_string(), python_version.to_string());
        let options = BuildImageOptions::<String> {
            dockerfile: "Dockerfile".to_string(),
            t: tag.clone(),
            rm: true,
            buildargs,
            ..Default::default()
        };

        let build = async {
            let mut stream = self.docker.build_image(options, None, Some(context.into()));
            while let Some(item) = stream.next().await {
                let info = item.map_err(|e| SandboxError::ImageBuild(e.to_string()))?;
                if let Some(detail) = info.error {
                    return Err(SandboxError::ImageBuild(detail));
                }
            }
            Ok(())
        };

        match tokio::time::timeout(BUILD_TIMEOUT, build).await {
            Ok(Ok(())) => Ok(tag),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SandboxError::ImageBuild(format!(
                "Build timed out after {}s",
                BUILD_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Steps 4–11 of the provisioning sequence, run against a started
    /// container. Clone and checkout failures abort the attempt; install
    /// and test-patch failures are logged and tolerated.
    async fn bootstrap(&self, sandbox: &mut DockerSandbox, task: &TaskRecord) -> SandboxResult<()> {
        let clone = sandbox
            .exec_in_container(
                &sandbox.container_id.clone(),
                &format!("git clone --quiet https://github.com/{}.git {REPO_ROOT}", task.repo),
                "/workspace",
                CLONE_TIMEOUT,
            )
            .await;
        if !clone.success {
            return Err(SandboxError::Clone(clone.stderr));
        }

        let checkout = sandbox
            .exec_raw(&format!("git checkout --quiet {}", task.base_commit), CHECKOUT_TIMEOUT)
            .await;
        if !checkout.success {
            return Err(SandboxError::Checkout(checkout.stderr));
        }

        // Stage dependency manifests as they were at the setup commit,
        // through blob retrieval rather than a second checkout.
        sandbox
            .exec_raw(&format!("mkdir -p {ENV_MANIFEST_DIR}"), PROBE_TIMEOUT)
            .await;
        let setup_commit = task.setup_commit();
        for manifest in MANIFEST_FILES {
            sandbox
                .exec_raw(
                    &format!(
                        "git show {setup_commit}:{manifest} > {ENV_MANIFEST_DIR}/{manifest} \
                         2>/dev/null || true"
                    ),
                    PROBE_TIMEOUT,
                )
                .await;
        }

        self.install_external_dependencies(sandbox).await;
        self.install_package(sandbox).await;

        sandbox
            .exec_raw(&format!("mkdir -p {AGENT_SCRATCH_DIR}"), PROBE_TIMEOUT)
            .await;
        sandbox
            .exec_raw(
                &format!("echo '.agent_temp/' >> {REPO_ROOT}/.gitignore"),
                PROBE_TIMEOUT,
            )
            .await;

        if !task.test_patch.trim().is_empty() {
            sandbox.protected_files = diff::patch_files(&task.test_patch);
            self.install_test_patch(sandbox, &task.test_patch).await;
        }

        let lockdown = sandbox
            .exec_raw(
                &format!("chmod -R a-w {REPO_ROOT} && chmod -R a+rX {REPO_ROOT}"),
                CHMOD_TIMEOUT,
            )
            .await;
        if !lockdown.success {
            warn!(stderr = %lockdown.stderr, "failed to strip write permission on repo tree");
        }

        self.run_baseline_test(sandbox, task).await;
        Ok(())
    }

    async fn install_external_dependencies(&self, sandbox: &mut DockerSandbox) {
        let mut installed = false;
        for manifest in PIP_MANIFESTS {
            let present = sandbox
                .exec_raw(&format!("test -f {ENV_MANIFEST_DIR}/{manifest}"), PROBE_TIMEOUT)
                .await;
            if !present.success {
                continue;
            }
            let result = sandbox
                .exec_raw(
                    &format!("pip install -r {ENV_MANIFEST_DIR}/{manifest} -q"),
                    INSTALL_TIMEOUT,
                )
                .await;
            if result.success {
                installed = true;
                info!(%manifest, "installed dependencies");
            }
        }
        if !installed {
            warn!("no dependency manifest installed; proceeding with base environment");
        }
    }

    /// Editable install of the repository itself, accepting the first
    /// invocation that succeeds.
    async fn install_package(&self, sandbox: &mut DockerSandbox) {
        for command in [
            "pip install -e . -q 2>/dev/null",
            "pip install -e .[dev] -q 2>/dev/null",
            "pip install -e .[test] -q 2>/dev/null",
        ] {
            let result = sandbox.exec_raw(command, INSTALL_TIMEOUT).await;
            if result.success {
                info!(%command, "package installed");
                return;
            }
        }
        warn!("could not install package in editable mode; proceeding");
    }

    async fn install_test_patch(&self, sandbox: &mut DockerSandbox, test_patch: &str) {
        let patch_path = format!("{AGENT_SCRATCH_DIR}/test_patch.diff");
        if let Err(e) = sandbox.upload_file(&patch_path, test_patch.as_bytes()).await {
            warn!(error = %e, "failed to stage test patch");
            return;
        }
        let apply = sandbox
            .exec_raw(
                &format!("git apply --whitespace=fix --verbose {patch_path}"),
                APPLY_TIMEOUT,
            )
            .await;
        if !apply.success {
            // Tolerated, but the validator may now judge the wrong tests.
            warn!(stderr = %apply.stderr, "test patch failed to apply");
        }
        sandbox
            .exec_raw(&format!("rm -f {patch_path}"), PROBE_TIMEOUT)
            .await;
    }

    /// Best-effort diagnostic run of the first required test before the
    /// conversation opens.
    async fn run_baseline_test(&self, sandbox: &mut DockerSandbox, task: &TaskRecord) {
        let Some(test) = task.fail_to_pass.first() else {
            return;
        };
        let command = validator::test_command(&task.repo, &task.version, test);
        let result = sandbox
            .exec_raw(&command, Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS))
            .await;
        debug!(
            test = %test,
            passed = result.success,
            "baseline test before conversation"
        );
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    type Sandbox = DockerSandbox;

    /// Provision a fresh sandbox for `task`:
    ///
    /// 1. derive the Python version from `(repo, version)`;
    /// 2. ensure the base image, building it if absent;
    /// 3. start a resource-bounded container working in the repo root;
    /// 4. clone the repository and check out `base_commit`;
    /// 5. stage dependency manifests from `environment_setup_commit`;
    /// 6. install external dependencies, then the repo in editable mode;
    /// 7. create the solver scratch directory and ignore-list entry;
    /// 8. install the test patch and record the protected set;
    /// 9. strip write permission from the whole tree;
    /// 10. run one baseline test for diagnostics.
    async fn provision(&self, task: &TaskRecord) -> SandboxResult<DockerSandbox> {
        let python_version = runtime::python_version(&task.repo, &task.version);
        let image = self.ensure_image(python_version).await?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let container_name = format!(
            "fixbench-{}-{}",
            task.instance_id.replace('/', "-"),
            &suffix[..8]
        );

        let host_config = bollard::models::HostConfig {
            memory: Some(MEMORY_LIMIT_BYTES),
            cpu_period: Some(100_000),
            cpu_quota: Some((CPU_LIMIT * 100_000.0) as i64),
            ..Default::default()
        };
        let container_config = ContainerConfig {
            image: Some(image),
            working_dir: Some(REPO_ROOT.to_string()),
            host_config: Some(host_config),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(true),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::ContainerStart(e.to_string()))?;
        let container_id = response.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::ContainerStart(e.to_string()))?;

        let mut sandbox = DockerSandbox {
            docker: self.docker.clone(),
            container_id,
            container_name,
            cwd: REPO_ROOT.to_string(),
            repo_root: REPO_ROOT.to_string(),
            python_version: python_version.to_string(),
            base_commit: task.base_commit.clone(),
            task_id: task.instance_id.clone(),
            protected_files: Vec::new(),
            started: false,
            stopped: false,
            started_at: Instant::now(),
        };

        if let Err(e) = self.bootstrap(&mut sandbox, task).await {
            sandbox.stop().await;
            return Err(e);
        }

        sandbox.started = true;
        sandbox.started_at = Instant::now();
        info!(
            task = %sandbox.task_id,
            container = %sandbox.container_name,
            python = %sandbox.python_version,
            "sandbox started"
        );
        Ok(sandbox)
    }
}

/// A sandbox backed by one Docker container.
pub struct DockerSandbox {
    docker: Docker,
    container_id: String,
    container_name: String,
    cwd: String,
    repo_root: String,
    python_version: String,
    base_commit: String,
    task_id: String,
    protected_files: Vec<String>,
    started: bool,
    stopped: bool,
    started_at: Instant,
}

impl DockerSandbox {
    /// Files the solver may not modify (those installed by the test patch).
    pub fn protected_files(&self) -> &[String] {
        &self.protected_files
    }

    /// Best-effort liveness probe.
    pub async fn is_running(&self) -> bool {
        match self.docker.inspect_container(&self.container_id, None).await {
            Ok(info) => info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Point-in-time status, for logs.
    pub async fn status(&self) -> SandboxStatusSnapshot {
        SandboxStatusSnapshot {
            container_id: (!self.stopped).then(|| self.container_id.clone()),
            is_running: self.is_running().await,
            cwd: self.cwd.clone(),
            repo_root: self.repo_root.clone(),
            task_id: self.task_id.clone(),
        }
    }

    /// Execute inside the authoritative container at the current cwd.
    async fn exec_raw(&self, command: &str, timeout: Duration) -> BashResult {
        let container_id = self.container_id.clone();
        let cwd = self.cwd.clone();
        self.exec_in_container(&container_id, command, &cwd, timeout)
            .await
    }

    /// Execute a command in an arbitrary container; the workhorse behind
    /// every other execution path. Non-zero exit is not an error, just
    /// `success = false`.
    async fn exec_in_container(
        &self,
        container_id: &str,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> BashResult {
        let exec_options = CreateExecOptions {
            cmd: Some(vec![
                "bash".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            working_dir: Some(cwd.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = match self.docker.create_exec(container_id, exec_options).await {
            Ok(exec) => exec,
            Err(e) => return BashResult::denied(cwd, e.to_string()),
        };

        let started = match self.docker.start_exec(&exec.id, None).await {
            Ok(output) => output,
            Err(e) => return BashResult::denied(cwd, e.to_string()),
        };

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = started {
            let collect = async {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            };
            if tokio::time::timeout(timeout, collect).await.is_err() {
                return BashResult::denied(
                    cwd,
                    format!("Command timed out after {}s", timeout.as_secs()),
                );
            }
        }

        let exit_code = match self.docker.inspect_exec(&exec.id).await {
            Ok(inspect) => inspect.exit_code.unwrap_or(-1),
            Err(_) => -1,
        };

        BashResult {
            cwd: cwd.to_string(),
            stdout,
            stderr,
            success: exit_code == 0,
        }
    }

    /// Ship bytes into the container as a file, via a tar upload rather
    /// than shell interpolation.
    async fn upload_file(&self, remote_path: &str, contents: &[u8]) -> SandboxResult<()> {
        self.upload_file_to(&self.container_id.clone(), remote_path, contents)
            .await
    }

    async fn upload_file_to(
        &self,
        container_id: &str,
        remote_path: &str,
        contents: &[u8],
    ) -> SandboxResult<()> {
        let (dir, name) = remote_path
            .rsplit_once('/')
            .unwrap_or(("/", remote_path));
        let archive = tar_single_file(name, contents)?;
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    async fn handle_cd(&mut self, command: &str) -> BashResult {
        let target = command
            .split_whitespace()
            .nth(1)
            .map(|t| t.trim_matches(['\'', '"']))
            .unwrap_or("");

        if target.is_empty() {
            self.cwd = self.repo_root.clone();
            return BashResult {
                cwd: self.cwd.clone(),
                stdout: String::new(),
                stderr: String::new(),
                success: true,
            };
        }
        if target == "-" {
            return BashResult::denied(&self.cwd, "cd - not supported");
        }
        if target == "~" || target.starts_with("~/") {
            return BashResult::denied(
                &self.cwd,
                format!("Cannot cd outside repo root ({})", self.repo_root),
            );
        }

        let new_cwd = policy::resolve_path(&self.cwd, target);
        if !policy::is_within_repo(&new_cwd, &self.repo_root) {
            return BashResult::denied(
                &self.cwd,
                format!("Cannot cd outside repo root ({})", self.repo_root),
            );
        }

        let exists = self
            .exec_raw(&format!("test -d '{new_cwd}'"), PROBE_TIMEOUT)
            .await;
        if !exists.success {
            return BashResult::denied(
                &self.cwd,
                format!("bash: cd: {target}: No such file or directory"),
            );
        }

        self.cwd = new_cwd;
        BashResult {
            cwd: self.cwd.clone(),
            stdout: String::new(),
            stderr: String::new(),
            success: true,
        }
    }

    /// Compound commands may move the shell as a side effect. The command
    /// runs once, with a trailing marker line that captures the shell's
    /// final directory; the marker is stripped from the output the solver
    /// sees, and updates that would escape the repo root are discarded.
    async fn handle_compound(&mut self, command: &str, timeout: Duration) -> BashResult {
        const PWD_MARKER: &str = "__fixbench_pwd__:";

        let wrapped = format!(
            "{command}\n__fixbench_status=$?; echo \"{PWD_MARKER}$(pwd)\"; exit $__fixbench_status"
        );
        let mut result = self.exec_raw(&wrapped, timeout).await;

        let mut kept = String::new();
        let mut reported_pwd = None;
        for line in result.stdout.lines() {
            match line.strip_prefix(PWD_MARKER) {
                Some(pwd) => reported_pwd = Some(pwd.trim().to_string()),
                None => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }
        result.stdout = kept;

        if result.success {
            if let Some(new_cwd) = reported_pwd {
                if policy::is_within_repo(&new_cwd, &self.repo_root) {
                    self.cwd = new_cwd;
                }
            }
        }

        result.cwd = self.cwd.clone();
        result
    }

    async fn start_debug_container(&self, snapshot_tag: &str) -> Result<String, String> {
        let host_config = bollard::models::HostConfig {
            memory: Some(MEMORY_LIMIT_BYTES),
            cpu_period: Some(100_000),
            cpu_quota: Some((CPU_LIMIT * 100_000.0) as i64),
            ..Default::default()
        };
        let config = ContainerConfig {
            image: Some(snapshot_tag.to_string()),
            host_config: Some(host_config),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(true),
            ..Default::default()
        };
        let name = format!("{}-debug", self.container_name);
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| e.to_string())?;
        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.id)
    }

    /// Body of a debug run, executed against the temporary container.
    async fn debug_run(
        &self,
        temp_id: &str,
        patch: Option<&str>,
        command: &str,
        timeout: Duration,
    ) -> BashResult {
        self.exec_in_container(
            temp_id,
            &format!("chmod -R u+w {REPO_ROOT}"),
            REPO_ROOT,
            CHMOD_TIMEOUT,
        )
        .await;
        for file in &self.protected_files {
            self.exec_in_container(
                temp_id,
                &format!("chmod a-w {REPO_ROOT}/{file} 2>/dev/null || true"),
                REPO_ROOT,
                PROBE_TIMEOUT,
            )
            .await;
        }

        if let Some(patch) = patch.filter(|p| !p.trim().is_empty()) {
            let patch_path = format!("{AGENT_SCRATCH_DIR}/debug_patch.diff");
            if let Err(e) = self.upload_file_to(temp_id, &patch_path, patch.as_bytes()).await {
                return BashResult::denied(&self.cwd, format!("Failed to stage debug patch: {e}"));
            }
            let apply = self
                .exec_in_container(
                    temp_id,
                    &format!("git apply --whitespace=fix {patch_path}"),
                    REPO_ROOT,
                    APPLY_TIMEOUT,
                )
                .await;
            if !apply.success {
                return BashResult::denied(
                    &self.cwd,
                    format!("Debug patch failed: {}", apply.stderr),
                );
            }
        }

        self.exec_in_container(temp_id, command, &self.cwd, timeout)
            .await
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn cwd(&self) -> &str {
        &self.cwd
    }

    fn python_version(&self) -> &str {
        &self.python_version
    }

    fn started_at(&self) -> Instant {
        self.started_at
    }

    async fn execute_bash(&mut self, command: &str, timeout: Duration) -> BashResult {
        if !self.started {
            return BashResult::denied(&self.cwd, "Container not started");
        }

        let command = command.trim();

        if let Some(blocked) = policy::blocked_path(command) {
            return BashResult::denied(
                &self.cwd,
                format!("Access denied: {blocked} is outside the allowed workspace"),
            );
        }
        if let Some(message) = policy::vcs_restriction(command, &self.base_commit) {
            return BashResult::denied(&self.cwd, message);
        }

        let mut result = if policy::is_compound(command) {
            self.handle_compound(command, timeout).await
        } else if command == "cd" || command.starts_with("cd ") {
            self.handle_cd(command).await
        } else {
            let mut r = self.exec_raw(command, timeout).await;
            r.cwd = self.cwd.clone();
            r
        };

        result.stdout = truncate_bytes(&result.stdout, MAX_STDOUT_BYTES);
        result.stderr = truncate_bytes(&result.stderr, MAX_STDERR_BYTES);
        result
    }

    async fn apply_patch(&mut self, patch: &str) -> PatchOutcome {
        if !self.started {
            return PatchOutcome::rejected("Container not started");
        }
        if patch.trim().is_empty() {
            return PatchOutcome::rejected("Empty patch provided");
        }

        let violations = diff::protected_violations(patch, &self.protected_files);
        if !violations.is_empty() {
            return PatchOutcome::rejected(format!(
                "Cannot modify protected test files: {}",
                violations.join(", ")
            ));
        }

        // Open the write window; protected files stay locked inside it.
        self.exec_raw(&format!("chmod -R u+w {REPO_ROOT}"), CHMOD_TIMEOUT)
            .await;
        for file in &self.protected_files {
            self.exec_raw(
                &format!("chmod a-w {REPO_ROOT}/{file} 2>/dev/null || true"),
                PROBE_TIMEOUT,
            )
            .await;
        }

        let patch_path = format!("{AGENT_SCRATCH_DIR}/patch.diff");
        if let Err(e) = self.upload_file(&patch_path, patch.as_bytes()).await {
            self.exec_raw(&format!("chmod -R a-w {REPO_ROOT}"), CHMOD_TIMEOUT)
                .await;
            return PatchOutcome::rejected(format!("Failed to write patch file: {e}"));
        }

        // Three strategies, most faithful first.
        let mut apply = self
            .exec_raw(
                &format!("git apply --whitespace=fix --verbose {patch_path}"),
                APPLY_TIMEOUT,
            )
            .await;
        if !apply.success {
            apply = self
                .exec_raw(
                    &format!("git apply --whitespace=fix --3way {patch_path}"),
                    APPLY_TIMEOUT,
                )
                .await;
        }
        if !apply.success {
            apply = self
                .exec_raw(
                    &format!("patch -p1 --ignore-whitespace < {patch_path}"),
                    APPLY_TIMEOUT,
                )
                .await;
        }

        self.exec_raw(&format!("rm -f {patch_path}"), PROBE_TIMEOUT)
            .await;
        self.exec_raw(
            &format!("chmod -R a-w {REPO_ROOT} && chmod -R a+rX {REPO_ROOT}"),
            CHMOD_TIMEOUT,
        )
        .await;

        PatchOutcome {
            success: apply.success,
            stdout: apply.stdout,
            stderr: apply.stderr,
        }
    }

    async fn execute_debug(
        &mut self,
        patch: Option<&str>,
        command: &str,
        timeout: Duration,
    ) -> BashResult {
        if !self.started {
            return BashResult::denied(&self.cwd, "Container not started");
        }

        if let Some(patch) = patch {
            let violations = diff::protected_violations(patch, &self.protected_files);
            if !violations.is_empty() {
                return BashResult::denied(
                    &self.cwd,
                    format!("Cannot modify protected test files: {}", violations.join(", ")),
                );
            }
        }

        // Snapshot the current state; the snapshot and its container are
        // destroyed unconditionally before returning.
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let snapshot_tag = format!("fixbench-debug-{}", &suffix[..8]);
        let commit = self
            .docker
            .commit_container(
                CommitContainerOptions {
                    container: self.container_id.clone(),
                    repo: snapshot_tag.clone(),
                    tag: "latest".to_string(),
                    pause: true,
                    ..Default::default()
                },
                ContainerConfig::<String>::default(),
            )
            .await;
        if let Err(e) = commit {
            return BashResult::denied(&self.cwd, format!("Failed to create debug snapshot: {e}"));
        }
        let snapshot = format!("{snapshot_tag}:latest");

        let temp_id = match self.start_debug_container(&snapshot).await {
            Ok(id) => id,
            Err(e) => {
                self.remove_image_quietly(&snapshot).await;
                return BashResult::denied(
                    &self.cwd,
                    format!("Failed to start debug container: {e}"),
                );
            }
        };

        let mut result = self.debug_run(&temp_id, patch, command, timeout).await;
        result.cwd = self.cwd.clone();

        if let Err(e) = self
            .docker
            .remove_container(
                &temp_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(error = %e, "failed to remove debug container");
        }
        self.remove_image_quietly(&snapshot).await;

        result
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> BashResult {
        let container_id = self.container_id.clone();
        self.exec_in_container(&container_id, command, &self.repo_root, timeout)
            .await
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.started = false;

        if let Err(e) = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            // The container may already be gone; stop() must still succeed.
            warn!(container = %self.container_name, error = %e, "container removal failed");
        } else {
            debug!(container = %self.container_name, "sandbox destroyed");
        }
    }
}

impl DockerSandbox {
    async fn remove_image_quietly(&self, image: &str) {
        if let Err(e) = self
            .docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
        {
            warn!(%image, error = %e, "failed to remove debug snapshot image");
        }
    }
}

/// Build an in-memory tar archive holding a single file.
fn tar_single_file(name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_archive_contains_the_file() {
        let archive = tar_single_file("patch.diff", b"diff --git a/x b/x\n").unwrap();
        let mut reader = tar::Archive::new(&archive[..]);
        let entries: Vec<_> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["patch.diff"]);
    }

    #[test]
    fn container_names_are_unique_per_attempt() {
        let a = uuid::Uuid::new_v4().simple().to_string();
        let b = uuid::Uuid::new_v4().simple().to_string();
        assert_ne!(a[..8], b[..8]);
    }
}
