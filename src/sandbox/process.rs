//! Process backend
//!
//! Runs each command as a plain child process in its own process group,
//! confined to a private directory. CPU time, file size and core dumps
//! are bounded by rlimits; memory and process count are enforced by a
//! monitor sampling /proc, which kills the group on the first overrun.
//! Jobs without network access get a fresh network namespace.
//!
//! There is no filesystem or pid namespace; use the isolate or docker
//! backend for untrusted production traffic.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::libc::rlim_t;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::capture::{join_capture, reap, spawn_capture, spawn_stdin, wait_bounded, WaitResult};
use super::procfs;
use super::{Environment, ExecRequest, IsolationBackend, RawOutcome, Termination, SANDBOX_PATH};
use crate::core::ResourceLimits;
use crate::languages::LanguageSpec;

const MONITOR_INTERVAL: Duration = Duration::from_millis(10);

/// Settings applied in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ChildPlan {
    cpu_secs: rlim_t,
    file_size: rlim_t,
    isolate_network: bool,
    shared_network: bool,
}

impl ChildPlan {
    fn new(limits: &ResourceLimits, shared_network: bool) -> Self {
        Self {
            // RLIMIT_CPU has second granularity; round up
            cpu_secs: limits.cpu_time_ms.div_ceil(1000).max(1) as rlim_t,
            file_size: (limits.max_file_size_kb * 1024) as rlim_t,
            isolate_network: !limits.network,
            shared_network,
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
        if self.isolate_network {
            if let Err(e) = unshare(CloneFlags::CLONE_NEWNET) {
                if !self.shared_network {
                    return Err(e.into());
                }
            }
        }
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

/// What the usage monitor saw while the command ran
#[derive(Debug, Default)]
struct Usage {
    memory_exceeded: AtomicBool,
    processes_exceeded: AtomicBool,
    peak_kb: AtomicU64,
}

impl Usage {
    fn peak_kb(&self) -> Option<u64> {
        match self.peak_kb.load(Ordering::Relaxed) {
            0 => None,
            kb => Some(kb),
        }
    }
}

/// Sample the group every tick and kill it on the first overrun
fn spawn_monitor(pgid: Pid, limits: &ResourceLimits, usage: Arc<Usage>) -> JoinHandle<()> {
    let memory_kb = limits.memory_kb();
    let max_processes = limits.max_processes as usize;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            ticker.tick().await;
            let sample = match tokio::task::spawn_blocking(move || procfs::sample(pgid.as_raw())).await {
                Ok(Some(sample)) => sample,
                _ => break,
            };

            usage.peak_kb.fetch_max(sample.peak_kb, Ordering::Relaxed);
            let over_memory = sample.rss_kb > memory_kb;
            let over_processes = sample.group_size > max_processes;
            if over_memory || over_processes {
                usage.memory_exceeded.store(over_memory, Ordering::Relaxed);
                usage.processes_exceeded.store(over_processes, Ordering::Relaxed);
                kill_group(pgid);
                break;
            }
        }
    })
}

/// Whether this host lets a child enter a fresh network namespace
pub async fn network_namespaces_available() -> bool {
    let mut cmd = Command::new("true");
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    // SAFETY: unshare is a single syscall
    unsafe {
        cmd.pre_exec(|| unshare(CloneFlags::CLONE_NEWNET).map_err(Into::into));
    }
    matches!(cmd.status().await, Ok(status) if status.success())
}

/// Sandbox backend built on plain child processes
pub struct ProcessBackend {
    root: PathBuf,
    shared_network: bool,
}

impl ProcessBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            shared_network: false,
        }
    }

    /// Run jobs that ask for no network on the host network when the host
    /// refuses to create a namespace, instead of failing them
    pub fn with_shared_network(mut self, allow: bool) -> Self {
        self.shared_network = allow;
        self
    }
}

fn kill_group(pgid: Pid) {
    // ESRCH just means the group is already gone
    let _ = killpg(pgid, Signal::SIGKILL);
}

/// Resolve `./prog` against the sandbox root so it does not depend on
/// how the platform orders chdir and exec
fn resolve_program(root: &Path, program: &str) -> PathBuf {
    match program.strip_prefix("./") {
        Some(relative) => root.join(relative),
        None => PathBuf::from(program),
    }
}

/// Apply what the monitor saw to how the leader stopped
fn with_usage(termination: Termination, usage: &Usage, lingering: usize, max_processes: u32) -> Termination {
    match termination {
        Termination::Exited(_) | Termination::Signaled(_) => {
            if usage.memory_exceeded.load(Ordering::Relaxed) {
                Termination::MemoryExceeded
            } else if usage.processes_exceeded.load(Ordering::Relaxed) || lingering + 1 > max_processes as usize {
                Termination::ProcessLimitExceeded
            } else {
                termination
            }
        }
        other => other,
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn health_check(&self) -> Result<()> {
        if network_namespaces_available().await {
            return Ok(());
        }
        if !self.shared_network {
            anyhow::bail!(
                "Cannot create network namespaces (needs CAP_SYS_ADMIN); \
                 set CODEBOX_PROCESS_SHARED_NETWORK=true to run jobs on the host network"
            );
        }
        warn!("Network namespaces unavailable; jobs will share the host network");
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
        tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).await?;

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
        let (program, args) = request.command.split_first().context("Empty command")?;
        let plan = ChildPlan::new(request.limits, self.shared_network);

        let mut cmd = Command::new(resolve_program(&env.root, program));
        cmd.args(args)
            .current_dir(&env.root)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &env.root)
            .env("TMPDIR", &env.root)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: the closure only issues async-signal-safe syscalls
        // (setpgid/unshare/setrlimit) and captures a Copy value.
        unsafe {
            cmd.pre_exec(move || plan.apply());
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

        let usage = Arc::new(Usage::default());
        let monitor = pgid.map(|pgid| spawn_monitor(pgid, request.limits, usage.clone()));

        let stdin_task = spawn_stdin(child.stdin.take(), request.stdin.map(|s| s.to_vec()));
        let stdout_task = spawn_capture(child.stdout.take(), request.output_limit);
        let stderr_task = spawn_capture(child.stderr.take(), request.output_limit);

        let wall = Duration::from_millis(request.limits.wall_time_ms);
        let waited = wait_bounded(&mut child, wall, cancel).await;
        let elapsed = started.elapsed();
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        // Background processes the program left behind count against the
        // ceiling, then die with the step
        let mut lingering = 0;
        if let Some(pgid) = pgid {
            lingering = tokio::task::spawn_blocking(move || procfs::count_group(pgid.as_raw()))
                .await
                .unwrap_or(0);
            kill_group(pgid);
        }

        let termination = match waited {
            Ok(WaitResult::Exited(status)) => Termination::from_exit_status(status),
            Ok(WaitResult::TimedOut) => {
                reap(&mut child, request.grace).await;
                Termination::WallTimeout
            }
            Ok(WaitResult::Cancelled) => {
                reap(&mut child, request.grace).await;
                Termination::Cancelled
            }
            Err(e) => {
                reap(&mut child, request.grace).await;
                stdin_task.abort();
                return Err(e).context("Failed to wait for sandboxed process");
            }
        };
        let termination = with_usage(termination, &usage, lingering, request.limits.max_processes);
        stdin_task.abort();

        let stdout = join_capture(stdout_task, request.grace).await;
        let stderr = join_capture(stderr_task, request.grace).await;

        debug!(
            "Sandbox {} finished {:?} in {}ms",
            env.id,
            termination,
            elapsed.as_millis()
        );

        Ok(RawOutcome {
            termination,
            stdout,
            stderr,
            elapsed,
            cpu_time_ms: None,
            peak_memory_kb: usage.peak_kb(),
        })
    }

    async fn destroy(&self, env: &Environment) -> Result<()> {
        match tokio::fs::remove_dir_all(&env.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", env.root)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_language() -> LanguageSpec {
        LanguageSpec {
            id: "sh".into(),
            source_file: "main.sh".into(),
            compile_command: None,
            run_command: vec!["sh".into(), "main.sh".into()],
            image: "busybox".into(),
            compile_timeout: None,
            default_limits: ResourceLimits::default(),
        }
    }

    fn backend(root: &Path) -> ProcessBackend {
        ProcessBackend::new(root).with_shared_network(true)
    }

    fn command(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn request<'a>(command: &'a [String], limits: &'a ResourceLimits, stdin: Option<&'a [u8]>) -> ExecRequest<'a> {
        ExecRequest {
            command,
            stdin,
            limits,
            output_limit: 1024,
            grace: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_exec_echo_with_stdin() {
        let parent = tempfile::tempdir().unwrap();
        let backend = backend(parent.path());
        let limits = ResourceLimits::default();
        let env = backend.create("cbx-echo", 0, &shell_language(), &limits).await.unwrap();

        let cmd = command(&["sh", "-c", "cat; echo err >&2; exit 3"]);
        let outcome = backend
            .exec(&env, request(&cmd, &limits, Some(&b"ping\n"[..])), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Exited(3));
        assert_eq!(outcome.stdout.to_string_lossy(), "ping\n");
        assert_eq!(outcome.stderr.to_string_lossy(), "err\n");

        backend.destroy(&env).await.unwrap();
        assert!(!env.root.exists());
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_wall_timeout_kills_group() {
        let parent = tempfile::tempdir().unwrap();
        let backend = backend(parent.path());
        let limits = ResourceLimits {
            wall_time_ms: 200,
            ..ResourceLimits::default()
        };
        let env = backend.create("cbx-sleep", 0, &shell_language(), &limits).await.unwrap();

        let cmd = command(&["sh", "-c", "sleep 30 & sleep 30"]);
        let started = Instant::now();
        let outcome = backend
            .exec(&env, request(&cmd, &limits, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::WallTimeout);
        assert!(started.elapsed() < Duration::from_secs(3));
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_cancelled() {
        let parent = tempfile::tempdir().unwrap();
        let backend = backend(parent.path());
        let limits = ResourceLimits::default();
        let env = backend.create("cbx-cancel", 0, &shell_language(), &limits).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let cmd = command(&["sleep", "30"]);
        let outcome = backend.exec(&env, request(&cmd, &limits, None), &cancel).await.unwrap();
        assert_eq!(outcome.termination, Termination::Cancelled);
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let parent = tempfile::tempdir().unwrap();
        let backend = backend(parent.path());
        let limits = ResourceLimits::default();
        let env = backend.create("cbx-missing", 0, &shell_language(), &limits).await.unwrap();

        let cmd = command(&["./does-not-exist"]);
        let result = backend
            .exec(&env, request(&cmd, &limits, None), &CancellationToken::new())
            .await;
        assert!(result.is_err());
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_overrun_is_detected() {
        let parent = tempfile::tempdir().unwrap();
        let backend = backend(parent.path());
        let limits = ResourceLimits {
            memory_mb: 32,
            wall_time_ms: 10_000,
            ..ResourceLimits::default()
        };
        let env = backend.create("cbx-memory", 0, &shell_language(), &limits).await.unwrap();

        // tail keeps every byte of a line it has not finished, and /dev/zero has no newline
        let cmd = command(&["tail", "/dev/zero"]);
        let outcome = backend
            .exec(&env, request(&cmd, &limits, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::MemoryExceeded);
        assert!(outcome.peak_memory_kb.unwrap() > 32 * 1024);
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_ceiling_kills_the_group() {
        let parent = tempfile::tempdir().unwrap();
        let backend = backend(parent.path());
        let limits = ResourceLimits {
            max_processes: 4,
            ..ResourceLimits::default()
        };
        let env = backend.create("cbx-procs", 0, &shell_language(), &limits).await.unwrap();

        let spawn_many = "for i in 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20; do sleep 30 & done; echo spawned 20";
        for script in [format!("{}; wait", spawn_many), spawn_many.to_string()] {
            let cmd = command(&["sh", "-c", &script]);
            let started = Instant::now();
            let outcome = backend
                .exec(&env, request(&cmd, &limits, None), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(outcome.termination, Termination::ProcessLimitExceeded, "{}", script);
            assert!(started.elapsed() < Duration::from_secs(3));
        }
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_small_programs_stay_within_ceilings() {
        let parent = tempfile::tempdir().unwrap();
        let backend = backend(parent.path());
        let limits = ResourceLimits {
            max_processes: 4,
            ..ResourceLimits::default()
        };
        let env = backend.create("cbx-small", 0, &shell_language(), &limits).await.unwrap();

        let cmd = command(&["sh", "-c", "echo one | cat; echo two"]);
        let outcome = backend
            .exec(&env, request(&cmd, &limits, None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.termination, Termination::Exited(0));
        assert_eq!(outcome.stdout.to_string_lossy(), "one\ntwo\n");
        backend.destroy(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_network_gets_its_own_namespace() {
        let strict = ProcessBackend::new("/nonexistent");
        if !network_namespaces_available().await {
            assert!(strict.health_check().await.is_err());
            assert!(backend(Path::new("/nonexistent")).health_check().await.is_ok());
            eprintln!("network namespaces unavailable, skipping");
            return;
        }
        strict.health_check().await.unwrap();

        let parent = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(parent.path());
        let limits = ResourceLimits::default();
        assert!(!limits.network);
        let env = backend.create("cbx-net", 0, &shell_language(), &limits).await.unwrap();

        let cmd = command(&["cat", "/proc/net/dev"]);
        let outcome = backend
            .exec(&env, request(&cmd, &limits, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Exited(0));
        let stdout = outcome.stdout.to_string_lossy();
        let interfaces: Vec<&str> = stdout.lines().skip(2).map(|line| line.trim_start()).collect();
        assert!(interfaces.iter().all(|line| line.starts_with("lo:")), "{:?}", interfaces);
        backend.destroy(&env).await.unwrap();
    }

    #[test]
    fn test_usage_overrides_normal_exits_only() {
        let usage = Usage::default();
        assert_eq!(with_usage(Termination::Exited(0), &usage, 0, 4), Termination::Exited(0));
        assert_eq!(with_usage(Termination::Exited(0), &usage, 4, 4), Termination::ProcessLimitExceeded);

        usage.memory_exceeded.store(true, Ordering::Relaxed);
        assert_eq!(with_usage(Termination::Signaled(9), &usage, 0, 4), Termination::MemoryExceeded);
        assert_eq!(with_usage(Termination::WallTimeout, &usage, 0, 4), Termination::WallTimeout);
        assert_eq!(with_usage(Termination::Cancelled, &usage, 0, 4), Termination::Cancelled);
    }

    #[test]
    fn test_resolve_program() {
        let root = Path::new("/sandbox/x");
        assert_eq!(resolve_program(root, "./main"), PathBuf::from("/sandbox/x/main"));
        assert_eq!(resolve_program(root, "python3"), PathBuf::from("python3"));
    }
}
