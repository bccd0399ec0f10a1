use crate::shared::cancel::CancelToken;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Delay between the graceful termination signal and the hard kill.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o failure while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Overlay applied on top of the inherited orchestrator environment.
    pub env_overlay: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RawExecution {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Spawns one child and pumps its streams on reader threads while the main
/// thread polls for exit, the deadline, and cancellation. Timeout and
/// cancellation both terminate the child gracefully first, then hard, and
/// surface exit 124.
pub fn run_child(spec: &SpawnSpec, cancel: &CancelToken) -> Result<RawExecution, RunnerError> {
    if spec.argv.is_empty() {
        return Err(RunnerError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        });
    }
    let program = spec.argv.first().cloned().unwrap_or_default();
    let io_err = |source| RunnerError::Io {
        program: program.clone(),
        source,
    };

    let mut command = Command::new(&program);
    command
        .args(&spec.argv[1..])
        .current_dir(&spec.cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    for (key, value) in &spec.env_overlay {
        command.env(key, value);
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
        program: program.clone(),
        source,
    })?;

    if let Some(stdin_bytes) = spec.stdin.clone() {
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                let _ = stdin.write_all(&stdin_bytes);
            });
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_err(std::io::Error::other("missing stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_err(std::io::Error::other("missing stderr pipe")))?;

    let stdout_reader = thread::spawn(move || read_all(stdout));
    let stderr_reader = thread::spawn(move || read_all(stderr));

    let deadline = spec.timeout.map(|timeout| started + timeout);
    let mut timed_out = false;
    let mut cancelled = false;

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if cancel.is_cancelled() {
                    cancelled = true;
                    terminate_gracefully(&mut child, cancel);
                    break child.wait().map_err(&io_err)?;
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    timed_out = true;
                    terminate_gracefully(&mut child, cancel);
                    break child.wait().map_err(&io_err)?;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(source) => return Err(io_err(source)),
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    let exit_code = if timed_out || cancelled {
        124
    } else {
        exit_status.code().unwrap_or(-1)
    };

    Ok(RawExecution {
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        timed_out,
        cancelled,
    })
}

fn read_all(mut stream: impl Read) -> Vec<u8> {
    let mut buffer = Vec::new();
    let _ = stream.read_to_end(&mut buffer);
    buffer
}

/// Graceful-then-hard pair: SIGTERM, a bounded grace period, then SIGKILL.
fn terminate_gracefully(child: &mut std::process::Child, _cancel: &CancelToken) {
    send_term_signal(child.id());
    let grace_deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < grace_deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }
    let _ = child.kill();
}

#[cfg(unix)]
fn send_term_signal(pid: u32) {
    let _ = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn send_term_signal(_pid: u32) {}

/// Splits a string-form command into argv with shell-style quoting. No shell
/// is ever spawned; this only mirrors its word splitting. Single quotes are
/// literal runs, double quotes allow backslash escapes.
pub fn split_command_line(line: &str) -> Result<Vec<String>, String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ' ' | '\t' | '\n' => {
                if has_token {
                    argv.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            '\'' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                has_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => {
                    has_token = true;
                    current.push(escaped);
                }
                None => return Err("trailing backslash".to_string()),
            },
            other => {
                has_token = true;
                current.push(other);
            }
        }
    }

    if has_token {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err("command is empty".to_string());
    }
    Ok(argv)
}
