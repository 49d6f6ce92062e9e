//! Job executor - Stages one job inside its sandbox
//!
//! Writes the source, compiles when the language needs it, runs the
//! program with the job's stdin and classifies how it ended. Timeouts,
//! limit violations and crashes are outcomes; only failing to drive the
//! sandbox at all is an error.

use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::compiler::{compile_in_sandbox, CompileSettings};
use crate::config::ServiceConfig;
use crate::core::{JobId, JobState, OutcomeKind};
use crate::languages::LanguageSpec;
use crate::sandbox::{CapturedOutput, ExecRequest, Sandbox, Termination};

/// What the executor needs from a job
#[derive(Debug, Clone)]
pub struct JobPayload {
    pub id: JobId,
    pub source: String,
    pub stdin: Option<String>,
}

/// Everything observed while executing a job, before reporting
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: OutcomeKind,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub compile_output: Option<CapturedOutput>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
    pub message: Option<String>,
}

impl ExecutionReport {
    fn new(outcome: OutcomeKind) -> Self {
        Self {
            outcome,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            compile_output: None,
            exit_code: None,
            signal: None,
            elapsed: Duration::ZERO,
            cpu_time_ms: None,
            peak_memory_kb: None,
            message: None,
        }
    }
}

/// Classification of a run step termination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub outcome: OutcomeKind,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub message: Option<String>,
}

fn signal_name(sig: i32) -> String {
    Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", sig))
}

/// Map how the program stopped onto an outcome
pub fn classify(termination: Termination) -> Classified {
    let (outcome, exit_code, signal, message) = match termination {
        Termination::Exited(0) => (OutcomeKind::Success, Some(0), None, None),
        Termination::Exited(code) => (
            OutcomeKind::RuntimeError,
            Some(code),
            None,
            Some(format!("Exited with code {}", code)),
        ),
        Termination::Signaled(sig) => (
            OutcomeKind::RuntimeError,
            Some(128 + sig),
            Some(sig),
            Some(format!("Killed by {}", signal_name(sig))),
        ),
        Termination::WallTimeout => (
            OutcomeKind::Timeout,
            None,
            None,
            Some("Wall time limit exceeded".to_string()),
        ),
        Termination::CpuTimeout => (
            OutcomeKind::Timeout,
            None,
            None,
            Some("CPU time limit exceeded".to_string()),
        ),
        Termination::MemoryExceeded => (
            OutcomeKind::ResourceLimitExceeded,
            None,
            None,
            Some("Memory limit exceeded".to_string()),
        ),
        Termination::ProcessLimitExceeded => (
            OutcomeKind::ResourceLimitExceeded,
            None,
            None,
            Some("Process limit exceeded".to_string()),
        ),
        Termination::FileSizeExceeded => (
            OutcomeKind::ResourceLimitExceeded,
            None,
            None,
            Some("File size limit exceeded".to_string()),
        ),
        Termination::Cancelled => (OutcomeKind::Cancelled, None, None, None),
    };

    Classified {
        outcome,
        exit_code,
        signal,
        message,
    }
}

/// Runs jobs inside already provisioned sandboxes
#[derive(Debug, Clone)]
pub struct JobExecutor {
    compile: CompileSettings,
    output_limit: usize,
    grace: Duration,
}

impl JobExecutor {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            compile: CompileSettings {
                timeout: config.compile_timeout,
                memory_mb: config.compile_memory_mb,
                output_limit: config.max_output_bytes,
                grace: config.grace,
            },
            output_limit: config.max_output_bytes,
            grace: config.grace,
        }
    }

    /// Execute `job` in `sandbox`. `on_state` is told when the job enters
    /// the compile and run stages.
    pub async fn run<F>(
        &self,
        job: &JobPayload,
        language: &LanguageSpec,
        sandbox: &Sandbox,
        cancel: &CancellationToken,
        on_state: F,
    ) -> Result<ExecutionReport>
    where
        F: Fn(JobState) + Send + Sync,
    {
        sandbox
            .write_file(&language.source_file, job.source.as_bytes())
            .await
            .context("Failed to write source file")?;

        let mut compile_output = None;
        if language.needs_compile() {
            on_state(JobState::Compiling);
            let compiled = compile_in_sandbox(sandbox, language, &self.compile, cancel).await?;

            if compiled.cancelled {
                let mut report = ExecutionReport::new(OutcomeKind::Cancelled);
                report.elapsed = compiled.elapsed;
                return Ok(report);
            }
            if !compiled.success {
                info!(
                    "Job {} failed to compile: {}",
                    job.id,
                    compiled.message.as_deref().unwrap_or("unknown reason")
                );
                let mut report = ExecutionReport::new(OutcomeKind::CompileError);
                report.compile_output = Some(compiled.output);
                report.message = compiled.message;
                report.elapsed = compiled.elapsed;
                return Ok(report);
            }
            if !compiled.output.bytes.is_empty() {
                // Warnings from a successful build
                compile_output = Some(compiled.output);
            }
        }

        if cancel.is_cancelled() {
            return Ok(ExecutionReport::new(OutcomeKind::Cancelled));
        }

        on_state(JobState::Running);
        let outcome = sandbox
            .exec(
                ExecRequest {
                    command: &language.run_command,
                    stdin: job.stdin.as_deref().map(str::as_bytes),
                    limits: sandbox.limits(),
                    output_limit: self.output_limit,
                    grace: self.grace,
                },
                cancel,
            )
            .await
            .context("Failed to run program")?;

        let classified = classify(outcome.termination);
        debug!(
            "Job {} run step ended with {:?} -> {}",
            job.id, outcome.termination, classified.outcome
        );

        Ok(ExecutionReport {
            outcome: classified.outcome,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            compile_output,
            exit_code: classified.exit_code,
            signal: classified.signal,
            elapsed: outcome.elapsed,
            cpu_time_ms: outcome.cpu_time_ms,
            peak_memory_kb: outcome.peak_memory_kb,
            message: classified.message,
        })
    }
}
