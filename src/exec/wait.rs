use crate::deps::resolver;
use crate::shared::cancel::CancelToken;
use crate::state::ErrorRecord;
use crate::workspace::{check_relative, Workspace};
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct WaitOutcome {
    pub exit_code: i32,
    pub files: Vec<String>,
    pub wait_duration_ms: u64,
    pub poll_count: u64,
    pub timed_out: bool,
    pub error: Option<ErrorRecord>,
}

/// Polls the substituted glob until `min_count` matches appear, the timeout
/// elapses, or the run is cancelled. Matches are workspace-relative and
/// sorted; symlinks whose real target leaves the workspace never count.
pub fn wait_for_matches(
    workspace: &Workspace,
    glob_pattern: &str,
    timeout: Duration,
    poll_interval: Duration,
    min_count: usize,
    cancel: &CancelToken,
) -> WaitOutcome {
    if let Err(err) = check_relative(glob_pattern) {
        return WaitOutcome {
            exit_code: 2,
            error: Some(
                ErrorRecord::new(format!("unsafe wait_for glob: {err}"))
                    .with_context("glob", Value::String(glob_pattern.to_string())),
            ),
            ..WaitOutcome::default()
        };
    }

    let started = Instant::now();
    let deadline = started + timeout;
    let mut poll_count = 0u64;
    let files = loop {
        poll_count += 1;
        let matches = resolver::expand_one(workspace, glob_pattern).unwrap_or_default();

        if matches.len() >= min_count {
            return WaitOutcome {
                exit_code: 0,
                files: matches,
                wait_duration_ms: started.elapsed().as_millis().max(1) as u64,
                poll_count,
                timed_out: false,
                error: None,
            };
        }

        if cancel.is_cancelled() || Instant::now() + poll_interval > deadline {
            break matches;
        }
        if !cancel.sleep(poll_interval) {
            break matches;
        }
    };

    WaitOutcome {
        exit_code: 124,
        files,
        wait_duration_ms: started.elapsed().as_millis() as u64,
        poll_count,
        timed_out: true,
        error: Some(
            ErrorRecord::new(format!(
                "wait_for did not reach {min_count} match(es) within {} second(s)",
                timeout.as_secs()
            ))
            .with_context("glob", Value::String(glob_pattern.to_string()))
            .with_context("min_count", Value::from(min_count)),
        ),
    }
}
