//! Core data model shared by the scheduler, executor and reporter

pub mod job;
pub mod limits;
pub mod outcome;

pub use job::{JobId, JobRecord, JobState};
pub use limits::{LimitsOverride, ResourceLimits};
pub use outcome::OutcomeKind;
