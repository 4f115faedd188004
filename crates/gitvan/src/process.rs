use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Captured stdout is bounded; a subprocess that exceeds the cap fails the
/// call instead of ballooning memory.
pub(crate) const MAX_CAPTURED_STDOUT: usize = 12 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) exit_code: i32,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) timed_out: bool,
    pub(crate) truncated: bool,
    #[allow(dead_code)]
    pub(crate) duration: Duration,
}

/// Run a subprocess with an optional deadline, environment overrides, and a
/// bounded stdout capture. On timeout the child is killed and the partial
/// output returned with `timed_out` set.
pub(crate) fn run_command(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    env: &[(&str, &str)],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);
    for (k, v) in env {
        command.env(k, v);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    // Drain both pipes on reader threads while polling for exit; a child
    // writing more than the pipe buffer must never block against an
    // unread pipe.
    let stdout_reader = child.stdout.take().map(|mut out| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = (&mut out)
                .take((MAX_CAPTURED_STDOUT + 1) as u64)
                .read_to_end(&mut buf);
            // Keep the pipe flowing past the cap without retaining bytes.
            let _ = std::io::copy(&mut out, &mut std::io::sink());
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;

    let exit_code = loop {
        match child.try_wait().context("failed to poll subprocess")? {
            Some(status) => break status.code().unwrap_or(-1),
            None => {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        let _ = child.kill();
                        let _ = child.wait();
                        timed_out = true;
                        break -1;
                    }
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    };

    let mut stdout_bytes = stdout_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr_bytes = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    let truncated = stdout_bytes.len() > MAX_CAPTURED_STDOUT;
    if truncated {
        stdout_bytes.truncate(MAX_CAPTURED_STDOUT);
    }

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        truncated,
        duration: start.elapsed(),
    })
}
