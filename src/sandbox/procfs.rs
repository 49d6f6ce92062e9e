//! Process usage sampled from /proc

use std::fs;

/// One observation of a process group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    /// Resident set of the group leader in KiB
    pub rss_kb: u64,
    /// Peak resident set of the group leader in KiB
    pub peak_kb: u64,
    /// Live processes in the group, leader included
    pub group_size: usize,
}

/// Value of a `Key:   1234 kB` line in /proc/<pid>/status
pub fn status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Process group of a /proc/<pid>/stat line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn stat_pgrp(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // state, ppid, pgrp
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Number of processes whose process group is `pgid`
pub fn count_group(pgid: i32) -> usize {
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit())))
        .filter_map(|entry| fs::read_to_string(entry.path().join("stat")).ok())
        .filter(|stat| stat_pgrp(stat) == Some(pgid))
        .count()
}

/// Sample the group led by `pid`; `None` once the leader is gone
pub fn sample(pid: i32) -> Option<Sample> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    Some(Sample {
        // Zombies have no memory lines
        rss_kb: status_kb(&status, "VmRSS").unwrap_or(0),
        peak_kb: status_kb(&status, "VmHWM").unwrap_or(0),
        group_size: count_group(pid),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_kb() {
        let status = "Name:\tcat\nVmHWM:\t    2048 kB\nVmRSS:\t    1536 kB\nThreads:\t1\n";
        assert_eq!(status_kb(status, "VmRSS"), Some(1536));
        assert_eq!(status_kb(status, "VmHWM"), Some(2048));
        assert_eq!(status_kb(status, "VmSwap"), None);
    }

    #[test]
    fn test_stat_pgrp_with_awkward_name() {
        let stat = "4242 (my (odd) prog) S 4200 4242 4242 0 -1 4194560 120 0 0 0";
        assert_eq!(stat_pgrp(stat), Some(4242));
        assert_eq!(stat_pgrp("garbage"), None);
    }

    #[test]
    fn test_sample_self() {
        if !std::path::Path::new("/proc/self/status").exists() {
            return;
        }
        let sample = sample(std::process::id() as i32).unwrap();
        assert!(sample.rss_kb > 0);
        assert!(sample.peak_kb >= sample.rss_kb);
    }
}
