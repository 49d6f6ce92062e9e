//! Service configuration
//!
//! Loaded from environment variables (optionally via `.env`) with fixed
//! defaults for every key.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::ResourceLimits;

/// Which isolation primitive the provisioner drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Plain child processes with rlimits in a private directory
    Process,
    /// The `isolate` sandbox (cgroups + namespaces)
    Isolate,
    /// One container per step from the language's toolbox image
    Docker,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "isolate" => Ok(BackendKind::Isolate),
            "docker" => Ok(BackendKind::Docker),
            other => anyhow::bail!("Unknown sandbox backend: {}", other),
        }
    }
}

/// Top level service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Number of workers, i.e. maximum simultaneously running jobs
    pub workers: usize,
    /// Bounded intake queue capacity
    pub queue_capacity: usize,
    /// Host-wide ceiling of live sandboxes
    pub max_sandboxes: usize,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    /// Per-stream capture budget for stdout/stderr
    pub max_output_bytes: usize,
    /// Time allowed for forced termination to complete
    pub grace: Duration,
    /// Default compile timeout when the language does not set one
    pub compile_timeout: Duration,
    pub compile_memory_mb: u64,
    /// How long finished results stay retrievable
    pub result_ttl: Duration,
    pub backend: BackendKind,
    /// Let the process backend run jobs on the host network when it cannot
    /// create a network namespace
    pub process_shared_network: bool,
    /// Parent directory for process/docker sandbox roots
    pub sandbox_root: PathBuf,
    /// First isolate box id used by this service
    pub isolate_box_base: u32,
    pub bind_addr: String,
    pub redis_url: Option<String>,
    /// Defaults for languages that do not declare their own limits
    pub default_limits: ResourceLimits,
    /// Upper bound for any caller supplied override
    pub limit_ceiling: ResourceLimits,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            max_sandboxes: 16,
            max_source_bytes: 64 * 1024,
            max_stdin_bytes: 1024 * 1024,
            max_output_bytes: 64 * 1024,
            grace: Duration::from_millis(2_000),
            compile_timeout: Duration::from_secs(10),
            compile_memory_mb: 2048,
            result_ttl: Duration::from_secs(3600),
            backend: BackendKind::Isolate,
            process_shared_network: false,
            sandbox_root: std::env::temp_dir().join("codebox"),
            isolate_box_base: 0,
            bind_addr: "0.0.0.0:5000".to_string(),
            redis_url: None,
            default_limits: ResourceLimits::default(),
            limit_ceiling: ResourceLimits {
                cpu_time_ms: 30_000,
                wall_time_ms: 60_000,
                memory_mb: 2048,
                max_processes: 256,
                max_file_size_kb: 262_144, // 256MB
                network: false,
            },
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let workers = env_or("CODEBOX_WORKERS", defaults.workers)?;
        let config = Self {
            workers,
            queue_capacity: env_or("CODEBOX_QUEUE_CAPACITY", defaults.queue_capacity)?,
            // The provisioner ceiling must never be the tighter bound by default
            max_sandboxes: env_or("CODEBOX_MAX_SANDBOXES", defaults.max_sandboxes.max(workers))?,
            max_source_bytes: env_or("CODEBOX_MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            max_stdin_bytes: env_or("CODEBOX_MAX_STDIN_BYTES", defaults.max_stdin_bytes)?,
            max_output_bytes: env_or("CODEBOX_MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
            grace: Duration::from_millis(env_or("CODEBOX_GRACE_MS", 2_000u64)?),
            compile_timeout: Duration::from_millis(env_or("CODEBOX_COMPILE_TIMEOUT_MS", 10_000u64)?),
            compile_memory_mb: env_or("CODEBOX_COMPILE_MEMORY_MB", defaults.compile_memory_mb)?,
            result_ttl: Duration::from_secs(env_or("CODEBOX_RESULT_TTL_SECS", 3600u64)?),
            backend: env_or("CODEBOX_BACKEND", defaults.backend)?,
            process_shared_network: env_or("CODEBOX_PROCESS_SHARED_NETWORK", defaults.process_shared_network)?,
            sandbox_root: std::env::var("CODEBOX_SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_root),
            isolate_box_base: env_or("CODEBOX_ISOLATE_BOX_BASE", defaults.isolate_box_base)?,
            bind_addr: std::env::var("CODEBOX_BIND").unwrap_or(defaults.bind_addr),
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            default_limits: defaults.default_limits,
            limit_ceiling: ResourceLimits {
                wall_time_ms: env_or("CODEBOX_MAX_WALL_MS", defaults.limit_ceiling.wall_time_ms)?,
                cpu_time_ms: env_or("CODEBOX_MAX_CPU_MS", defaults.limit_ceiling.cpu_time_ms)?,
                memory_mb: env_or("CODEBOX_MAX_MEMORY_MB", defaults.limit_ceiling.memory_mb)?,
                ..defaults.limit_ceiling
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("CODEBOX_WORKERS must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("CODEBOX_QUEUE_CAPACITY must be at least 1");
        }
        if self.max_sandboxes == 0 {
            anyhow::bail!("CODEBOX_MAX_SANDBOXES must be at least 1");
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert_eq!("Docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!("isolate".parse::<BackendKind>().unwrap(), BackendKind::Isolate);
        assert!("firecracker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_env_or_parses_and_rejects() {
        std::env::set_var("CODEBOX_TEST_ENV_OR_OK", " 12 ");
        std::env::set_var("CODEBOX_TEST_ENV_OR_BAD", "twelve");

        assert_eq!(env_or("CODEBOX_TEST_ENV_OR_OK", 1usize).unwrap(), 12);
        assert_eq!(env_or("CODEBOX_TEST_ENV_OR_MISSING", 7usize).unwrap(), 7);
        assert!(env_or("CODEBOX_TEST_ENV_OR_BAD", 1usize).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert!(config.max_sandboxes >= config.workers);
        assert_eq!(config.backend, BackendKind::Isolate);
        assert!(!config.process_shared_network);

        let broken = ServiceConfig {
            workers: 0,
            ..ServiceConfig::default()
        };
        assert!(broken.validate().is_err());
    }
}
