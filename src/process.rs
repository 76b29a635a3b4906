//! Timed subprocess execution.
//!
//! Engine and converter invocations are blocking external commands with
//! no inherent bound, so every one of them runs through [`run`], which
//! pipes stdin/stdout/stderr and kills the child when the deadline
//! passes.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::EngineError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Collected result of a finished (or killed) command.
#[derive(Debug)]
pub struct ProcessOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Run `command`, feeding it `stdin` if given, and collect its output.
///
/// `context` names the operation in errors. The child is killed once
/// `timeout` elapses; a killed child is reported as
/// [`EngineError::Timeout`], never as a partial success.
pub fn run(
    command: &mut Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    context: &str,
) -> Result<ProcessOutput, EngineError> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| EngineError::CommandFailed {
        context: context.to_string(),
        message: format!("failed to spawn: {e}"),
    })?;

    // Feed stdin from its own thread so a child that stops reading
    // cannot deadlock us against a full pipe.
    let stdin_thread = stdin.map(|input| {
        let mut pipe = child.stdin.take().expect("stdin was requested piped");
        let input = input.to_vec();
        thread::spawn(move || {
            // The child may exit without draining stdin; that is its call.
            let _ = pipe.write_all(&input);
        })
    });

    let mut stdout_pipe = child.stdout.take().expect("stdout is piped");
    let stdout_thread = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        buf
    });
    let mut stderr_pipe = child.stderr.take().expect("stderr is piped");
    let stderr_thread = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr_pipe.read_to_string(&mut buf);
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::Timeout {
                        context: context.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                return Err(EngineError::CommandFailed {
                    context: context.to_string(),
                    message: format!("wait failed: {e}"),
                })
            }
        }
    };

    if let Some(handle) = stdin_thread {
        let _ = handle.join();
    }
    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    Ok(ProcessOutput {
        success: status.success(),
        stdout,
        stderr,
    })
}

/// Like [`run`], but a non-zero exit is already an error.
pub fn run_checked(
    command: &mut Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    context: &str,
) -> Result<ProcessOutput, EngineError> {
    let output = run(command, stdin, timeout, context)?;
    if !output.success {
        return Err(EngineError::CommandFailed {
            context: context.to_string(),
            message: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}
