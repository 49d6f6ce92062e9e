//! Resource limits for a single job

use serde::{Deserialize, Serialize};

/// Effective resource limits applied to a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in milliseconds
    pub cpu_time_ms: u64,
    /// Wall-clock limit in milliseconds
    pub wall_time_ms: u64,
    /// Memory ceiling in MB
    pub memory_mb: u64,
    /// Maximum number of processes/threads
    pub max_processes: u32,
    /// Maximum size of a single written file in KB
    pub max_file_size_kb: u64,
    /// Whether the sandbox gets network access
    pub network: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_ms: 5_000,
            wall_time_ms: 5_000,
            memory_mb: 256,
            max_processes: 64,
            max_file_size_kb: 65_536, // 64MB
            network: false,
        }
    }
}

impl ResourceLimits {
    /// Overlay a caller supplied override on top of these limits
    pub fn with_override(&self, over: &LimitsOverride) -> Self {
        Self {
            cpu_time_ms: over.cpu_time_ms.unwrap_or(self.cpu_time_ms),
            wall_time_ms: over.wall_time_ms.unwrap_or(self.wall_time_ms),
            memory_mb: over.memory_mb.unwrap_or(self.memory_mb),
            max_processes: over.max_processes.unwrap_or(self.max_processes),
            max_file_size_kb: over.max_file_size_kb.unwrap_or(self.max_file_size_kb),
            network: over.network.unwrap_or(self.network),
        }
    }

    /// Cap every limit at the given ceiling. Network is only allowed if the
    /// ceiling allows it.
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> Self {
        Self {
            cpu_time_ms: self.cpu_time_ms.clamp(1, ceiling.cpu_time_ms),
            wall_time_ms: self.wall_time_ms.clamp(1, ceiling.wall_time_ms),
            memory_mb: self.memory_mb.clamp(1, ceiling.memory_mb),
            max_processes: self.max_processes.clamp(1, ceiling.max_processes),
            max_file_size_kb: self.max_file_size_kb.clamp(1, ceiling.max_file_size_kb),
            network: self.network && ceiling.network,
        }
    }

    pub fn memory_kb(&self) -> u64 {
        self.memory_mb * 1024
    }
}

/// Caller supplied limits; unset fields fall back to language defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsOverride {
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub memory_mb: Option<u64>,
    pub max_processes: Option<u32>,
    pub max_file_size_kb: Option<u64>,
    pub network: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_only_replaces_set_fields() {
        let base = ResourceLimits::default();
        let over = LimitsOverride {
            wall_time_ms: Some(1_000),
            memory_mb: Some(128),
            ..Default::default()
        };

        let limits = base.with_override(&over);
        assert_eq!(limits.wall_time_ms, 1_000);
        assert_eq!(limits.memory_mb, 128);
        assert_eq!(limits.cpu_time_ms, base.cpu_time_ms);
        assert_eq!(limits.max_processes, base.max_processes);
    }

    #[test]
    fn test_clamp_to_ceiling() {
        let ceiling = ResourceLimits {
            cpu_time_ms: 10_000,
            wall_time_ms: 20_000,
            memory_mb: 1024,
            max_processes: 128,
            max_file_size_kb: 1024,
            network: false,
        };
        let requested = ResourceLimits {
            cpu_time_ms: 60_000,
            wall_time_ms: 0,
            memory_mb: 4096,
            max_processes: 8,
            max_file_size_kb: 10,
            network: true,
        };

        let limits = requested.clamp_to(&ceiling);
        assert_eq!(limits.cpu_time_ms, 10_000);
        assert_eq!(limits.wall_time_ms, 1);
        assert_eq!(limits.memory_mb, 1024);
        assert_eq!(limits.max_processes, 8);
        assert_eq!(limits.max_file_size_kb, 10);
        assert!(!limits.network);
    }
}
