//! Isolate backend
//!
//! Wrapper around the isolate sandbox (https://github.com/ioi/isolate).
//! Each sandbox slot maps to one isolate box id; cgroups provide the
//! memory ceiling and peak memory accounting.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::capture::{read_file_capped, reap, wait_bounded, WaitResult};
use super::meta::{parse_meta, IsolateMeta, IsolateStatus};
use super::{Environment, ExecRequest, IsolationBackend, RawOutcome, Termination, SANDBOX_PATH};
use crate::core::ResourceLimits;
use crate::languages::LanguageSpec;

const STDIN_FILE: &str = ".codebox_stdin";
const STDOUT_FILE: &str = ".codebox_stdout";
const STDERR_FILE: &str = ".codebox_stderr";

/// Sandbox backend driving the `isolate` binary in cgroup mode
pub struct IsolateBackend {
    box_base: u32,
    isolate_bin: String,
}

impl IsolateBackend {
    pub fn new(box_base: u32) -> Self {
        Self {
            box_base,
            isolate_bin: "isolate".to_string(),
        }
    }

    fn box_id(&self, slot: u32) -> String {
        (self.box_base + slot).to_string()
    }

    async fn cleanup_box(&self, box_id: &str) -> Result<()> {
        let output = Command::new(&self.isolate_bin)
            .args(["--box-id", box_id, "--cg", "--cleanup"])
            .output()
            .await
            .context("Failed to run isolate --cleanup")?;
        if !output.status.success() {
            anyhow::bail!(
                "isolate --cleanup failed for box {}: {}",
                box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn build_args(&self, env: &Environment, request: &ExecRequest<'_>, meta_file: &Path) -> Vec<String> {
        let limits = request.limits;
        let mut args = vec![
            "--box-id".to_string(),
            self.box_id(env.slot),
            "--cg".to_string(),
            format!("--cg-mem={}", limits.memory_kb()),
            format!("--time={}", limits.cpu_time_ms as f64 / 1000.0),
            format!("--wall-time={}", limits.wall_time_ms as f64 / 1000.0),
            format!("--meta={}", meta_file.display()),
            format!("--stdout={}", STDOUT_FILE),
            format!("--stderr={}", STDERR_FILE),
            format!("--processes={}", limits.max_processes),
            format!("--fsize={}", limits.max_file_size_kb),
            "--open-files=256".to_string(),
            // Mount directories needed for toolchains and runtimes
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64:maybe".to_string(),
            "--dir=/etc:noexec".to_string(),
            format!("--env=PATH={}", SANDBOX_PATH),
            "--env=HOME=/box".to_string(),
        ];

        if limits.network {
            args.push("--share-net".to_string());
        }
        if request.stdin.is_some() {
            args.push(format!("--stdin={}", STDIN_FILE));
        }

        args.push("--run".to_string());
        args.push("--".to_string());

        // Bare program names are resolved under /usr/bin inside the box
        let mut cmd_iter = request.command.iter();
        if let Some(cmd) = cmd_iter.next() {
            if cmd.starts_with('/') || cmd.starts_with("./") {
                args.push(cmd.clone());
            } else {
                args.push(format!("/usr/bin/{}", cmd));
            }
            args.extend(cmd_iter.cloned());
        }

        args
    }
}

/// Map isolate's report onto a termination
fn termination_from_meta(meta: &IsolateMeta, limits: &ResourceLimits) -> Result<Termination> {
    if meta.oom_killed || meta.memory_kb > limits.memory_kb() {
        return Ok(Termination::MemoryExceeded);
    }
    let termination = match &meta.status {
        IsolateStatus::Ok => Termination::Exited(meta.exit_code),
        IsolateStatus::RuntimeError => Termination::Exited(meta.exit_code),
        IsolateStatus::TimeOut if meta.is_wall_timeout() => Termination::WallTimeout,
        IsolateStatus::TimeOut => Termination::CpuTimeout,
        IsolateStatus::Signal(sig) => Termination::from_signal(*sig),
        IsolateStatus::InternalError => anyhow::bail!(
            "isolate internal error: {}",
            meta.message.as_deref().unwrap_or("unknown")
        ),
    };
    Ok(termination)
}

#[async_trait]
impl IsolationBackend for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    /// Initialise and clean a probe box to confirm cgroup support
    async fn health_check(&self) -> Result<()> {
        let box_id = self.box_id(0);
        let output = Command::new(&self.isolate_bin)
            .args(["--box-id", &box_id, "--cg", "--init"])
            .output()
            .await
            .context("Failed to run isolate; is it installed?")?;
        let _ = self.cleanup_box(&box_id).await;

        if !output.status.success() {
            anyhow::bail!(
                "Isolate cgroup support is required but not available: {}",
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
        let box_id = self.box_id(slot);

        // A crashed predecessor may have left the box initialised
        let _ = self.cleanup_box(&box_id).await;

        let output = Command::new(&self.isolate_bin)
            .args(["--box-id", &box_id, "--cg", "--init"])
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to initialize isolate box {}: {}", box_id, stderr.trim());
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        info!("Initialized isolate box {} at {:?}", box_id, box_path);

        Ok(Environment {
            id: id.to_string(),
            root: box_path.join("box"),
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

        let meta_file = std::env::temp_dir().join(format!("codebox_meta_{}.txt", env.id));
        if let Some(stdin) = request.stdin {
            fs::write(env.root.join(STDIN_FILE), stdin).await?;
        }

        let args = self.build_args(env, &request, &meta_file);
        debug!("Running isolate with args: {:?}", args);

        let started = Instant::now();
        let mut child = Command::new(&self.isolate_bin)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to run isolate")?;

        // isolate enforces the wall limit itself; ours is only a backstop
        let backstop = Duration::from_millis(request.limits.wall_time_ms) + request.grace;
        let waited = wait_bounded(&mut child, backstop, cancel).await;
        let elapsed = started.elapsed();

        let forced = match waited? {
            WaitResult::Exited(_) => None,
            WaitResult::TimedOut => Some(Termination::WallTimeout),
            WaitResult::Cancelled => Some(Termination::Cancelled),
        };
        if forced.is_some() {
            reap(&mut child, request.grace).await;
        }

        let meta_content = fs::read_to_string(&meta_file).await.unwrap_or_default();
        let _ = fs::remove_file(&meta_file).await;
        let meta = parse_meta(&meta_content);

        let stdout = read_file_capped(&env.root.join(STDOUT_FILE), request.output_limit).await;
        let stderr = read_file_capped(&env.root.join(STDERR_FILE), request.output_limit).await;
        for name in [STDIN_FILE, STDOUT_FILE, STDERR_FILE] {
            let _ = fs::remove_file(env.root.join(name)).await;
        }

        let termination = match forced {
            Some(termination) => termination,
            None => termination_from_meta(&meta, request.limits)?,
        };

        Ok(RawOutcome {
            termination,
            stdout,
            stderr,
            elapsed,
            cpu_time_ms: Some(meta.time_ms),
            peak_memory_kb: Some(meta.memory_kb),
        })
    }

    async fn destroy(&self, env: &Environment) -> Result<()> {
        self.cleanup_box(&self.box_id(env.slot)).await?;
        info!("Cleaned up isolate box {}", self.box_id(env.slot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_from_meta() {
        let limits = ResourceLimits::default();

        let meta = parse_meta("status:TO\nmessage:Time limit exceeded\n");
        assert_eq!(termination_from_meta(&meta, &limits).unwrap(), Termination::CpuTimeout);

        let meta = parse_meta("status:TO\nmessage:Time limit exceeded (wall clock)\n");
        assert_eq!(termination_from_meta(&meta, &limits).unwrap(), Termination::WallTimeout);

        let meta = parse_meta("status:SG\nexitsig:9\ncg-oom-killed:1\n");
        assert_eq!(termination_from_meta(&meta, &limits).unwrap(), Termination::MemoryExceeded);

        let meta = parse_meta("status:SG\nexitsig:8\n");
        assert_eq!(termination_from_meta(&meta, &limits).unwrap(), Termination::Signaled(8));

        let meta = parse_meta("status:RE\nexitcode:2\n");
        assert_eq!(termination_from_meta(&meta, &limits).unwrap(), Termination::Exited(2));

        let meta = parse_meta("status:XX\nmessage:cannot create cgroup\n");
        assert!(termination_from_meta(&meta, &limits).is_err());
    }

    #[test]
    fn test_build_args() {
        let backend = IsolateBackend::new(100);
        let env = Environment {
            id: "cbx-test".into(),
            root: PathBuf::from("/var/local/lib/isolate/103/box"),
            slot: 3,
            image: String::new(),
        };
        let limits = ResourceLimits {
            cpu_time_ms: 1500,
            memory_mb: 128,
            ..ResourceLimits::default()
        };
        let command = vec!["python3".to_string(), "main.py".to_string()];
        let request = ExecRequest {
            command: &command,
            stdin: Some(&b"1 2"[..]),
            limits: &limits,
            output_limit: 1024,
            grace: Duration::from_millis(100),
        };

        let args = backend.build_args(&env, &request, Path::new("/tmp/meta.txt"));
        assert_eq!(&args[..2], &["--box-id", "103"]);
        assert!(args.contains(&"--cg-mem=131072".to_string()));
        assert!(args.contains(&"--time=1.5".to_string()));
        assert!(args.contains(&format!("--stdin={}", STDIN_FILE)));
        assert!(!args.contains(&"--share-net".to_string()));
        assert_eq!(&args[args.len() - 2..], &["/usr/bin/python3", "main.py"]);
    }
}
