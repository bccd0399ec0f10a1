use super::{execute_document, prune_old_runs, CommonOptions};
use crate::queue;
use crate::shared::ids::generate_run_id;
use crate::state::StateStore;
use crate::workflow::{load_workflow, WorkflowError};
use crate::workspace::{check_relative, Workspace};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
struct RunArgs {
    workflow: String,
    context: Vec<String>,
    context_file: Option<String>,
    clean_processed: bool,
    /// `Some(None)` means the flag was given without a destination; the
    /// default is `<run_root>/processed.zip`.
    archive_processed: Option<Option<String>>,
    common: CommonOptions,
}

fn parse_args(args: &[String]) -> Result<RunArgs, String> {
    let mut parsed = RunArgs {
        workflow: String::new(),
        context: Vec::new(),
        context_file: None,
        clean_processed: false,
        archive_processed: None,
        common: CommonOptions::from_env(),
    };

    let mut rest = args.iter().peekable();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--context" => {
                let value = rest
                    .next()
                    .ok_or_else(|| "--context requires KEY=VALUE".to_string())?;
                parsed.context.push(value.clone());
            }
            "--context-file" => {
                let value = rest
                    .next()
                    .ok_or_else(|| "--context-file requires a path".to_string())?;
                parsed.context_file = Some(value.clone());
            }
            "--clean-processed" => parsed.clean_processed = true,
            "--archive-processed" => {
                let destination = rest
                    .peek()
                    .filter(|value| !value.starts_with("--"))
                    .map(|value| value.to_string());
                if destination.is_some() {
                    rest.next();
                }
                parsed.archive_processed = Some(destination);
            }
            flag if flag.starts_with("--") => {
                if !parsed.common.try_parse_flag(flag, &mut rest)? {
                    return Err(format!("unknown flag `{flag}`"));
                }
            }
            positional => {
                if !parsed.workflow.is_empty() {
                    return Err(format!("unexpected argument `{positional}`"));
                }
                parsed.workflow = positional.to_string();
            }
        }
    }

    if parsed.workflow.is_empty() {
        return Err("run requires a workflow path".to_string());
    }
    Ok(parsed)
}

/// Context assembly: workflow context first, `--context-file` entries next,
/// `--context KEY=VALUE` pairs last (last writer wins). All CLI values are
/// strings.
fn build_context(
    workflow_context: &Map<String, Value>,
    args: &RunArgs,
    workspace: &Workspace,
) -> Result<Map<String, Value>, String> {
    let mut context = workflow_context.clone();

    if let Some(context_file) = &args.context_file {
        let path = resolve_input_path(workspace.root(), context_file);
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| format!("failed to read context file {context_file}: {err}"))?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|err| format!("context file {context_file} is not valid JSON: {err}"))?;
        let Value::Object(entries) = parsed else {
            return Err(format!("context file {context_file} must hold a JSON object"));
        };
        for (key, value) in entries {
            let coerced = match value {
                Value::String(text) => text,
                other => crate::vars::render_value(&other),
            };
            context.insert(key, Value::String(coerced));
        }
    }

    for pair in &args.context {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!("invalid --context `{pair}`; expected KEY=VALUE"));
        };
        context.insert(key.to_string(), Value::String(value.to_string()));
    }

    Ok(context)
}

fn resolve_input_path(workspace_root: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}

pub fn cmd_run(workspace_root: &Path, args: &[String]) -> i32 {
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

    if let Err(err) = check_relative(&args.common.state_dir) {
        eprintln!("invalid state directory: {err}");
        return 2;
    }

    let workflow_path = resolve_input_path(workspace.root(), &args.workflow);
    let loaded = match load_workflow(&workspace, &workflow_path) {
        Ok(loaded) => loaded,
        Err(WorkflowError::Validation { issues }) => {
            for issue in &issues {
                eprintln!("validation error: {issue}");
            }
            return 2;
        }
        Err(err @ WorkflowError::Parse { .. }) => {
            eprintln!("validation error: {err}");
            return 2;
        }
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    let processed_dir = loaded.workflow.processed_dir().to_string();
    if args.clean_processed {
        if let Err(err) = queue::validate_clean_target(&workspace, &processed_dir) {
            eprintln!("--clean-processed refused: {err}");
            return 2;
        }
    }

    let explicit_archive = match &args.archive_processed {
        Some(Some(destination)) => {
            let destination_abs = resolve_input_path(workspace.root(), destination);
            let processed_abs = workspace.root().join(&processed_dir);
            if let Err(err) =
                queue::validate_archive_destination(&processed_abs, &destination_abs)
            {
                eprintln!("--archive-processed refused: {err}");
                return 2;
            }
            Some(destination_abs)
        }
        _ => None,
    };

    if args.common.dry_run {
        if args.clean_processed {
            println!("[dry-run] would clean {processed_dir}");
        }
        if args.archive_processed.is_some() {
            println!("[dry-run] would archive {processed_dir}");
        }
        println!("workflow {} is valid", loaded.source);
        return 0;
    }

    if args.clean_processed {
        match queue::clean_directory(&workspace, &processed_dir) {
            Ok(removed) => println!("cleaned {removed} entries from {processed_dir}"),
            Err(err) => {
                eprintln!("--clean-processed failed: {err}");
                return 2;
            }
        }
    }

    let context = match build_context(&loaded.workflow.context, &args, &workspace) {
        Ok(context) => context,
        Err(message) => {
            eprintln!("{message}");
            return 2;
        }
    };

    let run_id = generate_run_id();
    let store = StateStore::new(
        workspace.root(),
        &args.common.state_dir,
        &run_id,
        args.common.backups_enabled(),
    );
    let mut document =
        match store.initialize(&run_id, &loaded.source, &loaded.checksum, context) {
            Ok(document) => document,
            Err(err) => {
                eprintln!("failed to initialize run state: {err}");
                return 1;
            }
        };
    println!("created run {run_id}");

    let code = execute_document(&workspace, &loaded, &store, &mut document, &args.common, false);

    if code == 0 {
        if let Some(request) = &args.archive_processed {
            let destination = match (request, explicit_archive) {
                (Some(_), Some(destination)) => destination,
                _ => store.run_root().join("processed.zip"),
            };
            match queue::archive_directory(&workspace, &processed_dir, &destination) {
                Ok(()) => println!("archived {processed_dir} to {}", destination.display()),
                Err(err) => {
                    eprintln!("--archive-processed failed: {err}");
                    return 1;
                }
            }
        }
        prune_old_runs(workspace.root(), &args.common.state_dir);
    }

    code
}
