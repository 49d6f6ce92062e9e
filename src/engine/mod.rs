//! Engine module - Compile and run staging for one job
//!
//! The engine works on a sandbox it is handed; it never provisions or
//! destroys one.

pub mod compiler;
pub mod executor;

pub use compiler::{compile_in_sandbox, CompileResult, CompileSettings};
pub use executor::{classify, ExecutionReport, JobExecutor, JobPayload};
