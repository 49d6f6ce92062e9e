//! Result reporter - Builds the caller-facing result of a job
//!
//! Every job produces exactly one `ExecutionResult`. Infrastructure
//! faults are reduced to a generic message here; the detail only goes
//! to the log.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::{JobId, OutcomeKind};
use crate::engine::ExecutionReport;
use crate::sandbox::CapturedOutput;

const INTERNAL_ERROR_MESSAGE: &str = "Internal error while executing the job";

/// Final, immutable result of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub outcome: OutcomeKind,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed_ms: u64,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    fn empty(job_id: JobId, outcome: OutcomeKind) -> Self {
        Self {
            job_id,
            outcome,
            stdout: String::new(),
            stdout_truncated: false,
            stderr: String::new(),
            stderr_truncated: false,
            compile_output: None,
            exit_code: None,
            signal: None,
            elapsed_ms: 0,
            cpu_time_ms: None,
            peak_memory_kb: None,
            message: None,
            finished_at: Utc::now(),
        }
    }
}

/// Cut `bytes` to at most `limit` bytes without splitting a UTF-8 sequence.
/// Invalid sequences are replaced. Returns the text and whether anything was cut.
pub fn truncate_utf8(bytes: &[u8], limit: usize) -> (String, bool) {
    if bytes.len() <= limit {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }

    let mut end = limit;
    // Back off continuation bytes (10xxxxxx) to the start of a character
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    (String::from_utf8_lossy(&bytes[..end]).into_owned(), true)
}

/// Drop a trailing character that the capture budget cut in half
fn without_partial_char(bytes: &[u8]) -> &[u8] {
    for back in 1..=bytes.len().min(4) {
        let start = bytes.len() - back;
        let lead = bytes[start];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let width = match lead {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { &bytes[..start] } else { bytes };
    }
    bytes
}

/// Builds results under one output budget
#[derive(Debug, Clone)]
pub struct Reporter {
    max_output_bytes: usize,
}

impl Reporter {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    fn text(&self, output: &CapturedOutput) -> (String, bool) {
        let bytes = if output.truncated {
            without_partial_char(&output.bytes)
        } else {
            &output.bytes[..]
        };
        let (text, cut) = truncate_utf8(bytes, self.max_output_bytes);
        (text, cut || output.truncated)
    }

    /// Result of a job the executor ran to a classified outcome
    pub fn from_report(&self, job_id: JobId, report: ExecutionReport) -> ExecutionResult {
        let (stdout, stdout_truncated) = self.text(&report.stdout);
        let (stderr, stderr_truncated) = self.text(&report.stderr);
        let compile_output = report.compile_output.as_ref().map(|out| self.text(out).0);

        ExecutionResult {
            job_id,
            outcome: report.outcome,
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
            compile_output,
            exit_code: report.exit_code,
            signal: report.signal,
            elapsed_ms: report.elapsed.as_millis() as u64,
            cpu_time_ms: report.cpu_time_ms,
            peak_memory_kb: report.peak_memory_kb,
            message: report.message,
            finished_at: Utc::now(),
        }
    }

    /// Result of a job that hit an infrastructure fault
    pub fn fault(&self, job_id: JobId, err: &anyhow::Error, elapsed: Duration) -> ExecutionResult {
        error!("Job {} failed with an internal error: {:#}", job_id, err);
        let mut result = ExecutionResult::empty(job_id, OutcomeKind::InternalError);
        result.elapsed_ms = elapsed.as_millis() as u64;
        result.message = Some(INTERNAL_ERROR_MESSAGE.to_string());
        result
    }

    pub fn cancelled(&self, job_id: JobId, elapsed: Duration) -> ExecutionResult {
        let mut result = ExecutionResult::empty(job_id, OutcomeKind::Cancelled);
        result.elapsed_ms = elapsed.as_millis() as u64;
        result.message = Some("Cancelled by request".to_string());
        result
    }

    /// Result of a job that was accepted but never run
    pub fn rejected(&self, job_id: JobId, reason: &str) -> ExecutionResult {
        let mut result = ExecutionResult::empty(job_id, OutcomeKind::Rejected);
        result.message = Some(reason.to_string());
        result
    }

    /// Result of a job the watchdog had to abort
    pub fn timed_out(&self, job_id: JobId, elapsed: Duration) -> ExecutionResult {
        let mut result = ExecutionResult::empty(job_id, OutcomeKind::Timeout);
        result.elapsed_ms = elapsed.as_millis() as u64;
        result.message = Some("Job exceeded its overall time budget".to_string());
        result
    }
}
