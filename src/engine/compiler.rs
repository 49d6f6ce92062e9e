//! Compile step
//!
//! Runs a language's compile command inside the job's own sandbox. The
//! compiler gets its own time and memory budget, independent of the
//! limits the program will run under.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::ResourceLimits;
use crate::languages::LanguageSpec;
use crate::sandbox::{CapturedOutput, ExecRequest, Sandbox, Termination};

/// Processes the toolchain may need (compiler driver, assembler, linker, JVM threads)
const COMPILE_MIN_PROCESSES: u32 = 64;

/// Budget for a compile step
#[derive(Debug, Clone)]
pub struct CompileSettings {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub output_limit: usize,
    pub grace: Duration,
}

/// Result of a compilation attempt
#[derive(Debug)]
pub struct CompileResult {
    pub success: bool,
    /// Compiler diagnostics (stderr, or stdout when stderr was empty)
    pub output: CapturedOutput,
    pub message: Option<String>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CompileResult {
    fn skipped() -> Self {
        Self {
            success: true,
            output: CapturedOutput::default(),
            message: None,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }
}

/// Limits the compile command runs under
pub fn compile_limits(settings: &CompileSettings, run_limits: &ResourceLimits) -> ResourceLimits {
    let timeout_ms = settings.timeout.as_millis() as u64;
    ResourceLimits {
        cpu_time_ms: timeout_ms,
        wall_time_ms: timeout_ms,
        memory_mb: settings.memory_mb,
        max_processes: run_limits.max_processes.max(COMPILE_MIN_PROCESSES),
        max_file_size_kb: run_limits.max_file_size_kb,
        network: false,
    }
}

/// Compile the job's source inside `sandbox`. Interpreted languages
/// succeed immediately. `Err` means the compiler could not be started.
pub async fn compile_in_sandbox(
    sandbox: &Sandbox,
    language: &LanguageSpec,
    settings: &CompileSettings,
    cancel: &CancellationToken,
) -> Result<CompileResult> {
    let Some(compile_cmd) = &language.compile_command else {
        return Ok(CompileResult::skipped());
    };

    let timeout = language.compile_timeout.unwrap_or(settings.timeout);
    let settings = CompileSettings {
        timeout,
        ..settings.clone()
    };
    let limits = compile_limits(&settings, sandbox.limits());
    debug!("Compiling with {:?} in sandbox {}", compile_cmd, sandbox.id());

    let outcome = sandbox
        .exec(
            ExecRequest {
                command: compile_cmd,
                stdin: None,
                limits: &limits,
                output_limit: settings.output_limit,
                grace: settings.grace,
            },
            cancel,
        )
        .await?;

    let output = if outcome.stderr.bytes.is_empty() {
        outcome.stdout
    } else {
        outcome.stderr
    };

    let (success, message) = match outcome.termination {
        Termination::Exited(0) => (true, None),
        Termination::Exited(code) => (false, Some(format!("Compilation failed with exit code {}", code))),
        Termination::WallTimeout | Termination::CpuTimeout => {
            (false, Some("Compilation timed out".to_string()))
        }
        Termination::MemoryExceeded => (false, Some("Compiler exceeded its memory limit".to_string())),
        Termination::ProcessLimitExceeded => (false, Some("Compiler exceeded its process limit".to_string())),
        Termination::FileSizeExceeded => (false, Some("Compiler output exceeded the file size limit".to_string())),
        Termination::Signaled(sig) => (false, Some(format!("Compiler crashed with signal {}", sig))),
        Termination::Cancelled => {
            return Ok(CompileResult {
                success: false,
                output,
                message: None,
                cancelled: true,
                elapsed: outcome.elapsed,
            })
        }
    };

    Ok(CompileResult {
        success,
        output,
        message,
        cancelled: false,
        elapsed: outcome.elapsed,
    })
}
