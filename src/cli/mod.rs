mod resume;
mod run;

pub use resume::cmd_resume;
pub use run::cmd_run;

use crate::engine::{ExecutionOptions, Interpreter, OnErrorMode};
use crate::shared::cancel::{install_sigint_hook, CancelToken};
use crate::shared::logging::{LogLevel, RunLogger};
use crate::state::{RunDocument, RunStatus, StateStore};
use crate::workflow::LoadedWorkflow;
use crate::workspace::Workspace;
use std::path::Path;

pub const DEFAULT_STATE_DIR: &str = ".orchestrate";

/// Entry point used by the binary: dispatch on the first argument, run from
/// the current directory as the workspace.
pub fn run(args: &[String]) -> i32 {
    let Ok(cwd) = std::env::current_dir() else {
        eprintln!("failed to resolve the current directory");
        return 1;
    };
    match args.first().map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => {
            println!("{}", help_text());
            0
        }
        Some("run") => cmd_run(&cwd, &args[1..]),
        Some("resume") => cmd_resume(&cwd, &args[1..]),
        Some(other) => {
            eprintln!("unknown command `{other}`\n\n{}", help_text());
            2
        }
    }
}

fn help_text() -> String {
    [
        "Usage: orchestrate <command> [options]",
        "",
        "Commands:",
        "  run <workflow>                       Run a workflow YAML document",
        "  resume <run_id>                      Resume an interrupted run",
        "",
        "Run options:",
        "  --context KEY=VALUE                  Context variable (repeatable)",
        "  --context-file PATH                  JSON file of context variables",
        "  --clean-processed                    Empty the processed directory first",
        "  --archive-processed [DEST]           Zip the processed directory on success",
        "",
        "Resume options:",
        "  --repair                             Recover state from the newest backup",
        "  --force-restart                      Ignore existing state; new run id",
        "",
        "Common options:",
        "  --debug                              Debug logging plus state backups",
        "  --dry-run                            Validate without executing",
        "  --backup-state                       Back up state before each step",
        "  --state-dir DIR                      Override the state directory",
        "  --on-error stop|continue             Unhandled failure policy",
        "  --max-retries N                      Default provider retry budget",
        "  --retry-delay MS                     Delay between retry attempts",
        "  --log-level LEVEL                    debug, info, warn or error",
        "  --quiet                              Errors only",
        "  --verbose                            Mirror log records to stderr",
    ]
    .join("\n")
}

#[derive(Debug, Clone)]
pub(crate) struct CommonOptions {
    pub debug: bool,
    pub dry_run: bool,
    pub backup_state: bool,
    pub state_dir: String,
    pub on_error: OnErrorMode,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub log_level: LogLevel,
    pub quiet: bool,
    pub verbose: bool,
}

impl CommonOptions {
    /// Defaults come from the `ORCHESTRATE_*` environment, then flags win.
    pub fn from_env() -> Self {
        let debug = std::env::var("ORCHESTRATE_DEBUG")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let state_dir = std::env::var("ORCHESTRATE_STATE_DIR")
            .unwrap_or_else(|_| DEFAULT_STATE_DIR.to_string());
        let log_level = std::env::var("ORCHESTRATE_LOG_LEVEL")
            .ok()
            .and_then(|raw| LogLevel::parse(&raw).ok())
            .unwrap_or(LogLevel::Info);
        Self {
            debug,
            dry_run: false,
            backup_state: false,
            state_dir,
            on_error: OnErrorMode::Stop,
            max_retries: 0,
            retry_delay_ms: 1000,
            log_level,
            quiet: false,
            verbose: false,
        }
    }

    /// Returns true when `arg` was a recognized common flag.
    pub fn try_parse_flag<'a, I>(&mut self, arg: &str, rest: &mut I) -> Result<bool, String>
    where
        I: Iterator<Item = &'a String>,
    {
        let mut value_of = |flag: &str| -> Result<String, String> {
            rest.next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match arg {
            "--debug" => self.debug = true,
            "--dry-run" => self.dry_run = true,
            "--backup-state" => self.backup_state = true,
            "--quiet" => self.quiet = true,
            "--verbose" => self.verbose = true,
            "--state-dir" => self.state_dir = value_of("--state-dir")?,
            "--on-error" => self.on_error = OnErrorMode::parse(&value_of("--on-error")?)?,
            "--max-retries" => {
                self.max_retries = value_of("--max-retries")?
                    .parse()
                    .map_err(|_| "--max-retries must be an integer".to_string())?
            }
            "--retry-delay" => {
                self.retry_delay_ms = value_of("--retry-delay")?
                    .parse()
                    .map_err(|_| "--retry-delay must be milliseconds".to_string())?
            }
            "--log-level" => self.log_level = LogLevel::parse(&value_of("--log-level")?)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn backups_enabled(&self) -> bool {
        self.backup_state || self.debug
    }

    pub fn effective_log_level(&self) -> LogLevel {
        if self.quiet {
            LogLevel::Error
        } else if self.debug || self.verbose {
            LogLevel::Debug
        } else {
            self.log_level
        }
    }

    pub fn execution_options(&self, resume: bool) -> ExecutionOptions {
        ExecutionOptions {
            on_error: self.on_error,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            debug: self.debug,
            resume,
        }
    }
}

/// Shared tail of `run` and `resume`: wire up the logger, signal hook, and
/// interpreter, then map the final status to an exit code.
pub(crate) fn execute_document(
    workspace: &Workspace,
    loaded: &LoadedWorkflow,
    store: &StateStore,
    document: &mut RunDocument,
    common: &CommonOptions,
    resume: bool,
) -> i32 {
    let logger = RunLogger::new(
        store.logs_dir(),
        common.effective_log_level(),
        common.verbose || common.debug,
    );
    install_sigint_hook();
    let cancel = CancelToken::new();

    logger.info(
        "run.started",
        &format!(
            "run {} for workflow {} (resume={resume})",
            document.run_id, loaded.source
        ),
    );

    let mut interpreter = Interpreter::new(
        &loaded.workflow,
        workspace,
        store,
        &logger,
        cancel,
        common.execution_options(resume),
    );
    match interpreter.execute(document) {
        Ok(RunStatus::Completed) => 0,
        Ok(_) => 1,
        Err(err) => {
            eprintln!("engine failure: {err}");
            1
        }
    }
}

/// `ORCHESTRATE_KEEP_RUNS=N` retains the N newest run directories; run ids
/// sort chronologically so a name sort is an age sort.
pub(crate) fn prune_old_runs(workspace_root: &Path, state_dir: &str) {
    let Some(keep) = std::env::var("ORCHESTRATE_KEEP_RUNS")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
    else {
        return;
    };
    let runs_dir = workspace_root.join(state_dir).join("runs");
    let Ok(entries) = std::fs::read_dir(&runs_dir) else {
        return;
    };
    let mut runs: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    runs.sort();
    while runs.len() > keep {
        let oldest = runs.remove(0);
        let _ = std::fs::remove_dir_all(oldest);
    }
}
