//! Job identity, lifecycle state and bookkeeping record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::limits::ResourceLimits;

/// Unique identifier of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used for sandbox and container names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Provisioning,
    Compiling,
    Running,
    Completed,
    Rejected,
    CompileError,
    Timeout,
    ResourceLimitExceeded,
    RuntimeError,
    ExecutorFault,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        self.rank() == Self::TERMINAL_RANK
    }

    /// Whether a cancellation request is still meaningful in this state
    pub fn is_cancellable(self) -> bool {
        !self.is_terminal()
    }

    const TERMINAL_RANK: u8 = 4;

    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Provisioning => 1,
            JobState::Compiling => 2,
            JobState::Running => 3,
            _ => Self::TERMINAL_RANK,
        }
    }

    /// Transitions only move forward; terminal states never change
    pub fn can_advance_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Provisioning => "provisioning",
            JobState::Compiling => "compiling",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Rejected => "rejected",
            JobState::CompileError => "compile_error",
            JobState::Timeout => "timeout",
            JobState::ResourceLimitExceeded => "resource_limit_exceeded",
            JobState::RuntimeError => "runtime_error",
            JobState::ExecutorFault => "executor_fault",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid job state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Scheduler-side record of a job. The payload itself travels with the
/// dispatch ticket; the record only holds what status queries need.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub language: String,
    pub limits: ResourceLimits,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: JobId, language: impl Into<String>, limits: ResourceLimits) -> Self {
        Self {
            id,
            language: language.into(),
            limits,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the job to `next`, stamping timestamps on the way
    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() && matches!(next, JobState::Provisioning) {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrip_and_short_form() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 12);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut record = JobRecord::new(JobId::new(), "cpp", ResourceLimits::default());
        record.advance(JobState::Provisioning).unwrap();
        assert!(record.started_at.is_some());

        // Interpreted languages skip the compile stage
        record.advance(JobState::Running).unwrap();
        assert!(record.advance(JobState::Compiling).is_err());
        assert!(record.advance(JobState::Queued).is_err());

        record.advance(JobState::Completed).unwrap();
        assert!(record.finished_at.is_some());
        assert!(record.advance(JobState::Cancelled).is_err());
        assert_eq!(record.state, JobState::Completed);
    }

    #[test]
    fn test_queued_job_can_be_cancelled_directly() {
        let mut record = JobRecord::new(JobId::new(), "cpp", ResourceLimits::default());
        assert!(record.state.is_cancellable());
        record.advance(JobState::Cancelled).unwrap();
        assert!(record.started_at.is_none());
        assert!(!record.state.is_cancellable());
    }
}
