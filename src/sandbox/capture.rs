//! Bounded output capture and child supervision
//!
//! Streams are drained to EOF even past the byte budget so a chatty
//! program never blocks on a full pipe.

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured stream content, cut at the byte budget
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    /// Whether bytes beyond the budget were discarded
    pub truncated: bool,
    /// Total bytes the program produced on this stream
    pub total_bytes: u64,
}

impl CapturedOutput {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            total_bytes: bytes.len() as u64,
            bytes,
            truncated: false,
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read `reader` to EOF keeping at most `limit` bytes
pub async fn capture<R>(mut reader: R, limit: usize) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut out = CapturedOutput::default();
    let mut buf = vec![0u8; 8192];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Output stream read failed: {}", e);
                break;
            }
        };

        out.total_bytes += n as u64;
        let room = limit.saturating_sub(out.bytes.len());
        if room > 0 {
            out.bytes.extend_from_slice(&buf[..n.min(room)]);
        }
        if n > room {
            out.truncated = true;
        }
    }

    out
}

/// Capture a child stream in the background
pub fn spawn_capture<R>(reader: Option<R>, limit: usize) -> JoinHandle<CapturedOutput>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match reader {
            Some(reader) => capture(reader, limit).await,
            None => CapturedOutput::default(),
        }
    })
}

/// Feed stdin in the background and close it; a program that never reads
/// stdin must not stall the supervisor.
pub fn spawn_stdin(stdin: Option<ChildStdin>, data: Option<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut stdin) = stdin else {
            return;
        };
        if let Some(data) = data {
            if let Err(e) = stdin.write_all(&data).await {
                debug!("Stdin write stopped: {}", e);
            }
        }
        let _ = stdin.shutdown().await;
    })
}

/// Wait for a capture task, giving up after `grace` (e.g. when an escaped
/// grandchild keeps the pipe open)
pub async fn join_capture(mut handle: JoinHandle<CapturedOutput>, grace: Duration) -> CapturedOutput {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("Capture task failed: {}", e);
            CapturedOutput::default()
        }
        Err(_) => {
            handle.abort();
            debug!("Capture task did not finish within grace period");
            CapturedOutput {
                truncated: true,
                ..CapturedOutput::default()
            }
        }
    }
}

/// Read a file written by the sandbox, keeping at most `limit` bytes.
/// A missing file reads as empty output.
pub async fn read_file_capped(path: &Path, limit: usize) -> CapturedOutput {
    match tokio::fs::File::open(path).await {
        Ok(file) => capture(file, limit).await,
        Err(_) => CapturedOutput::default(),
    }
}

/// How a supervised child stopped
#[derive(Debug)]
pub enum WaitResult {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Wait for `child` until it exits, `wall` elapses or `cancel` fires.
/// The caller is responsible for killing the child in the latter two cases.
pub async fn wait_bounded(
    child: &mut Child,
    wall: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<WaitResult> {
    tokio::select! {
        status = child.wait() => Ok(WaitResult::Exited(status?)),
        _ = tokio::time::sleep(wall) => Ok(WaitResult::TimedOut),
        _ = cancel.cancelled() => Ok(WaitResult::Cancelled),
    }
}

/// Reap a killed child, bounded by `grace`
pub async fn reap(child: &mut Child, grace: Duration) {
    let _ = child.start_kill();
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        debug!("Child did not exit within grace period after kill");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_truncates_but_drains() {
        let data = vec![b'x'; 20_000];
        let out = capture(&data[..], 100).await;

        assert_eq!(out.bytes.len(), 100);
        assert!(out.truncated);
        assert_eq!(out.total_bytes, 20_000);
    }

    #[tokio::test]
    async fn test_capture_within_budget() {
        let out = capture(&b"Hello, World!\n"[..], 1024).await;
        assert_eq!(out.to_string_lossy(), "Hello, World!\n");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_read_file_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        tokio::fs::write(&path, b"abcdef").await.unwrap();

        let out = read_file_capped(&path, 3).await;
        assert_eq!(out.bytes, b"abc");
        assert!(out.truncated);

        let missing = read_file_capped(&dir.path().join("nope"), 3).await;
        assert_eq!(missing, CapturedOutput::default());
    }
}
