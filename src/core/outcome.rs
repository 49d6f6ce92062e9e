use serde::{Deserialize, Serialize};
use std::fmt;

use super::job::JobState;

/// Classified terminal result of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceLimitExceeded,
    /// Infrastructure fault (provisioning or executor); details are only logged
    InternalError,
    Cancelled,
    Rejected,
}

impl OutcomeKind {
    /// Job state a job lands in when it finishes with this outcome
    pub fn terminal_state(self) -> JobState {
        match self {
            OutcomeKind::Success => JobState::Completed,
            OutcomeKind::CompileError => JobState::CompileError,
            OutcomeKind::RuntimeError => JobState::RuntimeError,
            OutcomeKind::Timeout => JobState::Timeout,
            OutcomeKind::ResourceLimitExceeded => JobState::ResourceLimitExceeded,
            OutcomeKind::InternalError => JobState::ExecutorFault,
            OutcomeKind::Cancelled => JobState::Cancelled,
            OutcomeKind::Rejected => JobState::Rejected,
        }
    }

    /// Whether the outcome is a service health signal rather than a code problem
    pub fn is_infrastructure_fault(self) -> bool {
        matches!(self, OutcomeKind::InternalError)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::CompileError => "compile_error",
            OutcomeKind::RuntimeError => "runtime_error",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::ResourceLimitExceeded => "resource_limit_exceeded",
            OutcomeKind::InternalError => "internal_error",
            OutcomeKind::Cancelled => "cancelled",
            OutcomeKind::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}
