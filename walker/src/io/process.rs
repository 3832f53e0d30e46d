//! Helpers for running worker child processes.
//!
//! Two shapes: a streaming run that tees line-delimited stdout to a log file
//! as it arrives, and a capturing run that buffers stdout/stderr in memory.
//! Both feed the prompt via stdin (prompts routinely exceed argv limits) and
//! read output concurrently with the child to avoid pipe deadlocks.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow};

/// Bound on in-memory capture buffers; bytes beyond this are drained and
/// dropped.
pub const CAPTURE_LIMIT_BYTES: usize = 1_000_000;

/// Result of one child invocation.
#[derive(Debug)]
pub struct ChildOutcome {
    pub status: ExitStatus,
    /// Captured stdout (capture mode only; empty for streaming runs).
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ChildOutcome {
    /// Exit code, or `None` when the child was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Run a command, teeing stdout lines into `stream_log_path` while the child
/// runs. stderr is captured in memory (bounded).
pub fn run_streaming(
    mut cmd: Command,
    stdin: &[u8],
    stream_log_path: &Path,
) -> Result<ChildOutcome> {
    if let Some(parent) = stream_log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log = File::create(stream_log_path)
        .with_context(|| format!("create stream log {}", stream_log_path.display()))?;

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn worker command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || tee_lines(stdout, log));
    let stderr_handle =
        thread::spawn(move || read_stream_limited(stderr, CAPTURE_LIMIT_BYTES));

    write_stdin(&mut child, stdin)?;
    let status = child.wait().context("wait for worker")?;

    join_reader(stdout_handle).context("join stdout tee")?;
    let (stderr, _) = join_reader(stderr_handle).context("join stderr")?;

    Ok(ChildOutcome {
        status,
        stdout: Vec::new(),
        stderr,
    })
}

/// Run a command capturing stdout/stderr to bounded in-memory buffers.
pub fn run_capturing(mut cmd: Command, stdin: &[u8]) -> Result<ChildOutcome> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn worker command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle =
        thread::spawn(move || read_stream_limited(stdout, CAPTURE_LIMIT_BYTES));
    let stderr_handle =
        thread::spawn(move || read_stream_limited(stderr, CAPTURE_LIMIT_BYTES));

    write_stdin(&mut child, stdin)?;
    let status = child.wait().context("wait for worker")?;

    let (stdout, _) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, _) = join_reader(stderr_handle).context("join stderr")?;

    Ok(ChildOutcome {
        status,
        stdout,
        stderr,
    })
}

fn write_stdin(child: &mut std::process::Child, input: &[u8]) -> Result<()> {
    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    // A worker that exits without reading its prompt breaks the pipe; that is
    // its prerogative, not an error here.
    let _ = child_stdin.write_all(input);
    Ok(())
}

fn join_reader<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn tee_lines<R: Read>(reader: R, mut log: File) -> Result<()> {
    let mut lines = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let n = lines.read_line(&mut line).context("read stream line")?;
        if n == 0 {
            break;
        }
        log.write_all(line.as_bytes()).context("write stream log")?;
        log.flush().context("flush stream log")?;
    }
    Ok(())
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_run_tees_stdout_to_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("stream.jsonl");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat; echo '{\"type\":\"result\"}'");
        let outcome =
            run_streaming(cmd, b"{\"type\":\"echoed\"}\n", &log_path).expect("run");

        assert_eq!(outcome.exit_code(), Some(0));
        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("echoed"));
        assert!(log.contains("result"));
    }

    #[test]
    fn capturing_run_collects_stdout_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let outcome = run_capturing(cmd, b"").expect("run");

        assert_eq!(outcome.exit_code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&outcome.stderr).trim(), "err");
    }

    #[test]
    fn child_ignoring_stdin_is_tolerated() {
        let cmd = Command::new("true");
        let outcome = run_capturing(cmd, &vec![b'x'; 1 << 20]).expect("run");
        assert_eq!(outcome.exit_code(), Some(0));
    }
}
