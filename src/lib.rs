//! Codebox - sandboxed execution of untrusted source code
//!
//! Jobs are submitted to the [`scheduler::Scheduler`], which runs each one
//! on a fixed worker pool inside a fresh sandbox from the
//! [`sandbox::Provisioner`] and reports a single
//! [`reporter::ExecutionResult`].

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod languages;
pub mod redis_manager;
pub mod reporter;
pub mod sandbox;
pub mod scheduler;
pub mod server;

pub use config::ServiceConfig;
pub use error::{ProvisionError, SubmitError};
pub use languages::{LanguageRegistry, LanguageSpec};
pub use reporter::ExecutionResult;
pub use scheduler::{Scheduler, SubmitRequest};
