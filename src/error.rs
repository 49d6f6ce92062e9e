//! Error taxonomy shared across modules

use serde::Serialize;

/// Synchronous rejection of a submission. These never enter the job lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SubmitError {
    #[error("unknown language: {language}")]
    UnknownLanguage { language: String },
    #[error("intake queue is full")]
    QueueFull,
    #[error("{field} is {size} bytes, limit is {limit} bytes")]
    PayloadTooLarge {
        field: &'static str,
        size: usize,
        limit: usize,
    },
    #[error("service is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    /// Stable reason code exposed to callers
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::UnknownLanguage { .. } => "UnknownLanguage",
            SubmitError::QueueFull => "QueueFull",
            SubmitError::PayloadTooLarge { .. } => "PayloadTooLarge",
            SubmitError::ShuttingDown => "ShuttingDown",
        }
    }
}

/// Failure to create a sandbox
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("sandbox capacity exhausted ({limit} live sandboxes)")]
    CapacityExhausted { limit: usize },
    #[error("sandbox setup failed: {0:#}")]
    Setup(#[source] anyhow::Error),
}
