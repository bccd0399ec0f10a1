use super::{execute_document, CommonOptions};
use crate::shared::ids::generate_run_id;
use crate::state::{RunStatus, StateError, StateStore, StepEntry, StepStatus};
use crate::workflow::{load_workflow, WorkflowError};
use crate::workspace::Workspace;
use std::path::Path;

#[derive(Debug, Clone)]
struct ResumeArgs {
    run_id: String,
    repair: bool,
    force_restart: bool,
    common: CommonOptions,
}

fn parse_args(args: &[String]) -> Result<ResumeArgs, String> {
    let mut parsed = ResumeArgs {
        run_id: String::new(),
        repair: false,
        force_restart: false,
        common: CommonOptions::from_env(),
    };

    let mut rest = args.iter().peekable();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--repair" => parsed.repair = true,
            "--force-restart" => parsed.force_restart = true,
            flag if flag.starts_with("--") => {
                if !parsed.common.try_parse_flag(flag, &mut rest)? {
                    return Err(format!("unknown flag `{flag}`"));
                }
            }
            positional => {
                if !parsed.run_id.is_empty() {
                    return Err(format!("unexpected argument `{positional}`"));
                }
                parsed.run_id = positional.to_string();
            }
        }
    }

    if parsed.run_id.is_empty() {
        return Err("resume requires a run id".to_string());
    }
    Ok(parsed)
}

pub fn cmd_resume(workspace_root: &Path, args: &[String]) -> i32 {
    let args = match parse_args(args) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return 2;
        }
    };

    let workspace = match Workspace::open(workspace_root) {
        Ok(workspace) => workspace,
        Err(err) => {
            eprintln!("failed to open workspace: {err}");
            return 1;
        }
    };

    let store = StateStore::new(
        workspace.root(),
        &args.common.state_dir,
        &args.run_id,
        args.common.backups_enabled(),
    );
    if !store.run_root().is_dir() {
        eprintln!("no run found with id `{}`", args.run_id);
        return 1;
    }

    // Corrupted documents go through the same recovery gate as checksum
    // mismatches: --repair rolls back to the newest parseable backup.
    let mut document = match store.load() {
        Ok(document) => document,
        Err(err @ (StateError::Corrupt { .. } | StateError::Missing { .. })) => {
            if !args.repair {
                eprintln!("failed to load run state: {err}");
                eprintln!("use --repair to recover from backups, or --force-restart");
                return 1;
            }
            match store.attempt_repair() {
                Ok(document) => {
                    println!("repaired run state from backup");
                    document
                }
                Err(repair_err) => {
                    eprintln!("state repair failed: {repair_err}");
                    return 1;
                }
            }
        }
        Err(err) => {
            eprintln!("failed to load run state: {err}");
            return 1;
        }
    };

    let workflow_path = workspace.root().join(&document.workflow_file);
    let loaded = match load_workflow(&workspace, &workflow_path) {
        Ok(loaded) => loaded,
        Err(WorkflowError::Validation { issues }) => {
            for issue in &issues {
                eprintln!("validation error: {issue}");
            }
            return 2;
        }
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    if loaded.checksum != document.workflow_checksum && !args.force_restart {
        // A corrupted document can also present as a mismatch; --repair rolls
        // back to the newest backup before giving up.
        let mut recovered = false;
        if args.repair {
            if let Ok(rolled_back) = store.attempt_repair() {
                recovered = rolled_back.workflow_checksum == loaded.checksum;
                if recovered {
                    println!("repaired run state from backup");
                    document = rolled_back;
                }
            }
        }
        if !recovered {
            eprintln!("the workflow changed since this run started (checksum mismatch)");
            eprintln!("use --force-restart to begin a new run from the edited workflow");
            return 1;
        }
    }

    if args.force_restart {
        let run_id = generate_run_id();
        println!("force restart: new run {run_id} (ignoring state of {})", args.run_id);
        let store = StateStore::new(
            workspace.root(),
            &args.common.state_dir,
            &run_id,
            args.common.backups_enabled(),
        );
        let mut fresh = match store.initialize(
            &run_id,
            &loaded.source,
            &loaded.checksum,
            document.context.clone(),
        ) {
            Ok(fresh) => fresh,
            Err(err) => {
                eprintln!("failed to initialize run state: {err}");
                return 1;
            }
        };
        return execute_document(&workspace, &loaded, &store, &mut fresh, &args.common, false);
    }

    if document.status == RunStatus::Completed {
        println!("run {} already completed; nothing to do", args.run_id);
        return 0;
    }

    print_progress_summary(&document.steps);
    if document.status == RunStatus::Failed {
        // Replays settled steps as no-ops and retries from the failure.
        document.status = RunStatus::Running;
    }

    execute_document(&workspace, &loaded, &store, &mut document, &args.common, true)
}

fn print_progress_summary(
    steps: &std::collections::BTreeMap<String, StepEntry>,
) {
    let mut completed = Vec::new();
    let mut pending = Vec::new();
    for (name, entry) in steps {
        match entry {
            StepEntry::Single(record) if record.status.is_settled() => completed.push(name.clone()),
            StepEntry::Single(record) if record.status == StepStatus::Failed => {
                pending.push(format!("{name} (failed)"))
            }
            StepEntry::Single(_) => pending.push(name.clone()),
            StepEntry::Loop(iterations) => {
                completed.push(format!("{name} ({} iterations)", iterations.len()))
            }
        }
    }
    if !completed.is_empty() {
        println!("  completed: {}", completed.join(", "));
    }
    if !pending.is_empty() {
        println!("  pending: {}", pending.join(", "));
    }
}
