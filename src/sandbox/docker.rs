//! Docker backend
//!
//! The sandbox is a private host directory bind-mounted at `/app`; every
//! compile or run step is a fresh container from the language's toolbox
//! image with networking disabled and memory, pid, CPU and file size
//! ceilings applied. Containers carry a label with the sandbox id so
//! destroy can find stragglers.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::capture::{join_capture, reap, spawn_capture, spawn_stdin, wait_bounded, WaitResult};
use super::{Environment, ExecRequest, IsolationBackend, RawOutcome, Termination};
use crate::core::ResourceLimits;
use crate::languages::LanguageSpec;

const SANDBOX_LABEL: &str = "codebox.sandbox";
const CONTAINER_WORKDIR: &str = "/app";

/// Go's zero time, reported as `StartedAt` of a container that never started
const NEVER_STARTED: &str = "0001-01-01";
const STATE_FORMAT: &str = "{{.State.OOMKilled}}|{{.State.ExitCode}}|{{.State.StartedAt}}|{{.State.Error}}";

/// What docker recorded about a finished step container
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerState {
    oom_killed: bool,
    exit_code: i32,
    started: bool,
    error: String,
}

impl ContainerState {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().splitn(4, '|');
        let oom_killed = fields.next()? == "true";
        let exit_code = fields.next()?.parse().ok()?;
        let started = !fields.next()?.starts_with(NEVER_STARTED);
        let error = fields.next().unwrap_or_default().trim().to_string();
        Some(Self {
            oom_killed,
            exit_code,
            started,
            error,
        })
    }
}

/// Sandbox backend running steps in toolbox containers
pub struct DockerBackend {
    root: PathBuf,
    docker_bin: String,
    step: AtomicU64,
}

impl DockerBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            docker_bin: "docker".to_string(),
            step: AtomicU64::new(0),
        }
    }

    fn run_args(&self, env: &Environment, request: &ExecRequest<'_>, name: &str) -> Vec<String> {
        let limits = request.limits;
        let cpu_secs = limits.cpu_time_ms.div_ceil(1000).max(1);

        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("{}={}", SANDBOX_LABEL, env.id),
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".to_string(),
            format!("{}m", limits.memory_mb),
            "--pids-limit".to_string(),
            limits.max_processes.to_string(),
            "--cpus".to_string(),
            "1".to_string(),
            "--ulimit".to_string(),
            format!("cpu={}:{}", cpu_secs, cpu_secs + 1),
            "--ulimit".to_string(),
            format!("fsize={}", limits.max_file_size_kb * 1024),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "-v".to_string(),
            format!("{}:{}", env.root.display(), CONTAINER_WORKDIR),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];

        if !limits.network {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        if request.stdin.is_some() {
            args.push("-i".to_string());
        }

        args.push(env.image.clone());
        args.extend(request.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run docker {}", args.first().unwrap_or(&"")))
    }

    async fn container_state(&self, name: &str) -> Option<ContainerState> {
        let output = self.docker(&["inspect", "-f", STATE_FORMAT, name]).await.ok()?;
        if !output.status.success() {
            return None;
        }
        ContainerState::parse(&String::from_utf8_lossy(&output.stdout))
    }

    async fn remove_container(&self, name: &str) {
        if let Err(e) = self.docker(&["rm", "-f", name]).await {
            warn!("Failed to remove container {}: {:#}", name, e);
        }
    }
}

/// How a step ended, or why the program never ran.
///
/// The `docker run` client exits 125-127 both when docker fails and when
/// the program itself returns those codes; only the container state
/// tells them apart.
fn step_termination(state: Option<&ContainerState>) -> Result<Termination, String> {
    let Some(state) = state else {
        return Err("container was never created".to_string());
    };
    if !state.started || !state.error.is_empty() {
        return Err(state.error.clone());
    }
    Ok(termination_from_exit_code(state.exit_code, state.oom_killed))
}

/// Map a container exit code onto a termination
fn termination_from_exit_code(code: i32, oom_killed: bool) -> Termination {
    if oom_killed {
        return Termination::MemoryExceeded;
    }
    // The container's main process was killed by a signal
    if (129..160).contains(&code) {
        return Termination::from_signal(code - 128);
    }
    Termination::Exited(code)
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn health_check(&self) -> Result<()> {
        let output = self.docker(&["version", "--format", "{{.Server.Version}}"]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "Docker daemon is not reachable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn create(
        &self,
        id: &str,
        slot: u32,
        language: &LanguageSpec,
        _limits: &ResourceLimits,
    ) -> Result<Environment> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create sandbox parent {:?}", self.root))?;

        let root = self.root.join(id);
        tokio::fs::create_dir(&root)
            .await
            .with_context(|| format!("Failed to create sandbox root {:?}", root))?;
        // The container user may differ from ours
        tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o777)).await?;

        Ok(Environment {
            id: id.to_string(),
            root,
            slot,
            image: language.image.clone(),
        })
    }

    async fn exec(
        &self,
        env: &Environment,
        request: ExecRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome> {
        if request.command.is_empty() {
            anyhow::bail!("Empty command");
        }

        let name = format!("{}-{}", env.id, self.step.fetch_add(1, Ordering::Relaxed));
        let args = self.run_args(env, &request, &name);
        debug!("Running docker with args: {:?}", args);

        let started = Instant::now();
        let mut child = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn docker")?;

        let stdin_task = spawn_stdin(child.stdin.take(), request.stdin.map(|s| s.to_vec()));
        let stdout_task = spawn_capture(child.stdout.take(), request.output_limit);
        let stderr_task = spawn_capture(child.stderr.take(), request.output_limit);

        let wall = Duration::from_millis(request.limits.wall_time_ms);
        let waited = wait_bounded(&mut child, wall, cancel).await;
        let elapsed = started.elapsed();

        let forced = match &waited {
            Ok(WaitResult::Exited(_)) => None,
            Ok(WaitResult::TimedOut) => Some(Termination::WallTimeout),
            Ok(WaitResult::Cancelled) => Some(Termination::Cancelled),
            Err(_) => Some(Termination::Cancelled),
        };
        if forced.is_some() {
            // Killing the client does not stop the container
            let _ = self.docker(&["kill", &name]).await;
            reap(&mut child, request.grace).await;
        }
        stdin_task.abort();

        let stdout = join_capture(stdout_task, request.grace).await;
        let stderr = join_capture(stderr_task, request.grace).await;
        let state = self.container_state(&name).await;
        self.remove_container(&name).await;

        match waited {
            Ok(WaitResult::Exited(_)) => {}
            Ok(_) => {
                return Ok(RawOutcome {
                    termination: forced.unwrap_or(Termination::WallTimeout),
                    stdout,
                    stderr,
                    elapsed,
                    cpu_time_ms: None,
                    peak_memory_kb: None,
                })
            }
            Err(e) => return Err(e).context("Failed to wait for docker"),
        }

        let termination = match step_termination(state.as_ref()) {
            Ok(termination) => termination,
            Err(reason) => anyhow::bail!(
                "docker run could not start {:?}: {} {}",
                request.command,
                reason,
                stderr.to_string_lossy().trim()
            ),
        };

        Ok(RawOutcome {
            termination,
            stdout,
            stderr,
            elapsed,
            cpu_time_ms: None,
            peak_memory_kb: None,
        })
    }

    async fn destroy(&self, env: &Environment) -> Result<()> {
        let filter = format!("label={}={}", SANDBOX_LABEL, env.id);
        let output = self.docker(&["ps", "-aq", "--filter", &filter]).await?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        if !ids.is_empty() {
            let mut args = vec!["rm", "-f"];
            args.extend(ids.iter().map(|s| s.as_str()));
            self.docker(&args).await?;
        }

        match tokio::fs::remove_dir_all(&env.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", env.root)),
        }
    }
}
