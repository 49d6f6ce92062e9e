//! Isolate meta file parser

/// Raw execution status reported by isolate
#[derive(Debug, Clone, PartialEq)]
pub enum IsolateStatus {
    /// Program exited normally
    Ok,
    /// Time limit exceeded (CPU or wall clock)
    TimeOut,
    /// Killed by signal
    Signal(i32),
    /// Non-zero exit
    RuntimeError,
    /// Internal error in isolate
    InternalError,
}

/// Parsed isolate meta file contents
#[derive(Debug, Clone)]
pub struct IsolateMeta {
    /// CPU time used in milliseconds
    pub time_ms: u64,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Peak memory in KB (cg-mem with cgroups, max-rss without)
    pub memory_kb: u64,
    pub exit_code: i32,
    pub status: IsolateStatus,
    /// Set when the cgroup OOM killer fired
    pub oom_killed: bool,
    /// Human readable message from isolate
    pub message: Option<String>,
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: 0,
            status: IsolateStatus::Ok,
            oom_killed: false,
            message: None,
        }
    }
}

impl IsolateMeta {
    /// isolate reports wall clock timeouts only through the message
    pub fn is_wall_timeout(&self) -> bool {
        self.message
            .as_deref()
            .map(|m| m.contains("wall clock"))
            .unwrap_or(false)
    }
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status_str = String::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.time_ms = (t * 1000.0) as u64;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_time_ms = (t * 1000.0) as u64;
                }
            }
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u64>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "cg-oom-killed" => {
                meta.oom_killed = value == "1";
            }
            "status" => {
                status_str = value.to_string();
            }
            "message" => {
                meta.message = Some(value.to_string());
            }
            "exitcode" => {
                meta.exit_code = value.parse().unwrap_or(0);
            }
            "exitsig" => {
                if let Ok(sig) = value.parse::<i32>() {
                    meta.status = IsolateStatus::Signal(sig);
                }
            }
            _ => {}
        }
    }

    // Determine status from status string if not already set by signal
    if meta.status == IsolateStatus::Ok {
        meta.status = match status_str.as_str() {
            "TO" => IsolateStatus::TimeOut,
            "SG" => IsolateStatus::Signal(0),
            "RE" => IsolateStatus::RuntimeError,
            "XX" => IsolateStatus::InternalError,
            "" if meta.exit_code == 0 => IsolateStatus::Ok,
            _ => IsolateStatus::RuntimeError,
        };
    } else if status_str == "TO" {
        // A timed out program is killed by signal; the timeout wins
        meta.status = IsolateStatus::TimeOut;
    }

    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_success() {
        let content = "time:0.015\ntime-wall:0.020\ncg-mem:1024\nexitcode:0\n";
        let meta = parse_meta(content);

        assert_eq!(meta.time_ms, 15);
        assert_eq!(meta.wall_time_ms, 20);
        assert_eq!(meta.memory_kb, 1024);
        assert_eq!(meta.exit_code, 0);
        assert_eq!(meta.status, IsolateStatus::Ok);
        assert!(!meta.oom_killed);
    }

    #[test]
    fn test_parse_meta_wall_timeout() {
        let content = "time:0.100\nstatus:TO\nkilled:1\nexitsig:9\nmessage:Time limit exceeded (wall clock)\n";
        let meta = parse_meta(content);

        assert_eq!(meta.status, IsolateStatus::TimeOut);
        assert!(meta.is_wall_timeout());
    }

    #[test]
    fn test_parse_meta_signal_and_oom() {
        let meta = parse_meta("status:SG\nexitsig:11\n");
        assert_eq!(meta.status, IsolateStatus::Signal(11));

        let meta = parse_meta("status:SG\nexitsig:9\ncg-oom-killed:1\ncg-mem:262144\n");
        assert!(meta.oom_killed);
        assert_eq!(meta.memory_kb, 262144);
    }

    #[test]
    fn test_parse_meta_runtime_error() {
        let meta = parse_meta("status:RE\nexitcode:1\nmessage:Exited with error status 1\n");
        assert_eq!(meta.status, IsolateStatus::RuntimeError);
        assert_eq!(meta.exit_code, 1);
        assert!(!meta.is_wall_timeout());
    }
}
