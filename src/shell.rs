//! One-shot shell command execution with a hard timeout.
//!
//! Every external command the watchdog issues goes through [`run`]. The
//! result is never an error: failures (spawn error, timeout, non-zero exit
//! with no output) are encoded into the returned text as `Error: <reason>`,
//! because downstream consumers pattern-match the engine's textual output
//! rather than inspect exit codes.

use std::fmt::Write as _;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Max bytes kept per stream. The engine CLI prints a few KB at most; a
/// misbehaving command can still flood the pipe, so everything past the cap
/// is counted and thrown away while the stream is drained to EOF.
const MAX_OUTPUT: usize = 1024 * 1024;

/// Captured result of a single [`run`] invocation.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, or `-1` if unavailable (killed, timed out).
    pub exit_code: i32,
    pub timed_out: bool,
    /// Spawn/wait/timeout failure reason, when the command never produced a
    /// meaningful exit.
    pub error: Option<String>,
}

impl CmdOutput {
    fn failed(reason: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: false,
            error: Some(reason),
        }
    }

    /// Collapse the capture into the legacy string contract: combined
    /// trimmed stdout+stderr on success, `Error: <reason>` otherwise.
    #[must_use]
    pub fn text(&self) -> String {
        if let Some(reason) = &self.error {
            return format!("Error: {reason}");
        }
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        if out.is_empty() && self.exit_code != 0 {
            return format!("Error: exit code {}", self.exit_code);
        }
        out
    }
}

/// Execute `command` via `/bin/sh -c` and capture both streams.
///
/// Stdout and stderr are read concurrently (closing one pipe early while the
/// child writes to the other deadlocks) and each capped at [`MAX_OUTPUT`].
/// The whole operation is bounded by `timeout_ms`; on expiry the child is
/// killed via `kill_on_drop`.
pub async fn run(command: &str, timeout_ms: u64) -> CmdOutput {
    let mut child = match Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return CmdOutput::failed(e.to_string()),
    };

    let Some(mut stdout) = child.stdout.take() else {
        return CmdOutput::failed("failed to take stdout pipe".to_string());
    };
    let Some(mut stderr) = child.stderr.take() else {
        return CmdOutput::failed("failed to take stderr pipe".to_string());
    };

    let timeout = tokio::time::Duration::from_millis(timeout_ms);
    let capture = async {
        // Both streams drain concurrently — the child may interleave writes,
        // and waiting on one pipe while the other fills up deadlocks.
        let (out, err) = tokio::join!(
            drain_stream(&mut stdout, MAX_OUTPUT),
            drain_stream(&mut stderr, MAX_OUTPUT),
        );
        // Drop pipe handles so the child sees EOF before wait()
        drop(stdout);
        drop(stderr);
        let status = child.wait().await;
        (out, err, status)
    };

    match tokio::time::timeout(timeout, capture).await {
        Ok((out, err, Ok(status))) => CmdOutput {
            stdout: out.into_text(),
            stderr: err.into_text(),
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
            error: None,
        },
        Ok((_, _, Err(e))) => CmdOutput::failed(format!("wait: {e}")),
        Err(_) => CmdOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: true,
            error: Some(format!("Command timed out after {timeout_ms}ms")),
        },
    }
}

/// What [`drain_stream`] kept of one child stream.
struct Capture {
    data: Vec<u8>,
    /// Bytes read past the cap and dropped.
    overflow: u64,
}

impl Capture {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.overflow > 0 {
            let _ = write!(text, "\n[output capped, {} bytes dropped]", self.overflow);
        }
        text
    }
}

/// Drain a child stream to EOF, keeping at most `limit` bytes.
///
/// The stream must be read to completion even once the cap is hit: closing a
/// pipe the child is still writing to raises SIGPIPE in the child and can
/// wedge the other stream.
async fn drain_stream(stream: &mut (impl tokio::io::AsyncRead + Unpin), limit: usize) -> Capture {
    let mut chunk = [0u8; 4096];
    let mut capture = Capture {
        data: Vec::new(),
        overflow: 0,
    };
    while let Ok(n) = stream.read(&mut chunk).await {
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(capture.data.len());
        let keep = n.min(room);
        capture.data.extend_from_slice(&chunk[..keep]);
        capture.overflow += (n - keep) as u64;
    }
    capture
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("echo hello", 5000).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.text(), "hello");
    }

    #[tokio::test]
    async fn test_run_combines_stderr() {
        let out = run("echo out; echo err >&2", 5000).await;
        let text = out.text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_without_output() {
        let out = run("exit 3", 5000).await;
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.text(), "Error: exit code 3");
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_with_output_keeps_output() {
        // Engine CLIs report failures as text on a non-zero exit; the text
        // wins so callers can pattern-match it.
        let out = run("echo 'Unable to connect'; exit 1", 5000).await;
        assert_eq!(out.text(), "Unable to connect");
    }

    #[tokio::test]
    async fn test_run_caps_runaway_output() {
        // 2 MiB of zeroes: half is kept, the rest is drained and counted.
        let out = run("head -c 2097152 /dev/zero", 10_000).await;
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("[output capped, 1048576 bytes dropped]"));
    }

    #[tokio::test]
    async fn test_run_timeout_is_tagged() {
        let out = run("sleep 5", 100).await;
        assert!(out.timed_out);
        assert_eq!(out.text(), "Error: Command timed out after 100ms");
    }
}
