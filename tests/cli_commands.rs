use orchestrate::cli::{cmd_resume, cmd_run};
use orchestrate::state::RunDocument;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn only_run_document(workspace: &Path) -> (String, RunDocument) {
    let runs_dir = workspace.join(".orchestrate/runs");
    let mut runs: Vec<_> = fs::read_dir(&runs_dir)
        .expect("runs dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    assert_eq!(runs.len(), 1, "expected exactly one run in {runs_dir:?}");
    let run_root = runs.remove(0);
    let raw = fs::read_to_string(run_root.join("state.json")).expect("state.json");
    let document: RunDocument = serde_json::from_str(&raw).expect("parse state");
    let run_id = run_root
        .file_name()
        .expect("run id")
        .to_string_lossy()
        .into_owned();
    (run_id, document)
}

#[test]
fn run_executes_a_workflow_and_persists_context() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        concat!(
            "version: \"1.1\"\n",
            "context:\n",
            "  team: platform\n",
            "steps:\n",
            "  - name: Greet\n",
            "    command: \"echo hi ${context.team} ${context.owner}\"\n",
        ),
    )
    .expect("workflow");

    let code = cmd_run(
        dir.path(),
        &args(&["workflow.yaml", "--context", "owner=dana", "--quiet"]),
    );
    assert_eq!(code, 0);

    let (_, document) = only_run_document(dir.path());
    assert_eq!(document.schema_version, "1.1.1");
    assert_eq!(document.context["team"], serde_json::json!("platform"));
    assert_eq!(document.context["owner"], serde_json::json!("dana"));
    assert_eq!(
        document.step("Greet").expect("Greet").output.as_deref(),
        Some("hi platform dana\n")
    );
}

#[test]
fn context_file_entries_lose_to_explicit_context_flags() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: Greet\n",
            "    command: \"echo ${context.region}\"\n",
        ),
    )
    .expect("workflow");
    fs::write(dir.path().join("ctx.json"), r#"{"region": "from-file"}"#).expect("context file");

    let code = cmd_run(
        dir.path(),
        &args(&[
            "workflow.yaml",
            "--context-file",
            "ctx.json",
            "--context",
            "region=from-flag",
            "--quiet",
        ]),
    );
    assert_eq!(code, 0);
    let (_, document) = only_run_document(dir.path());
    assert_eq!(document.context["region"], serde_json::json!("from-flag"));
}

#[test]
fn dry_run_validates_without_creating_a_run() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        "version: \"1.1\"\nsteps:\n  - name: A\n    command: \"true\"\n",
    )
    .expect("workflow");

    let code = cmd_run(dir.path(), &args(&["workflow.yaml", "--dry-run", "--quiet"]));
    assert_eq!(code, 0);
    assert!(!dir.path().join(".orchestrate").exists());
}

#[test]
fn invalid_workflows_exit_2() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        "version: \"9.9\"\nsteps:\n  - name: A\n    command: \"true\"\n",
    )
    .expect("workflow");
    assert_eq!(cmd_run(dir.path(), &args(&["workflow.yaml"])), 2);
}

#[test]
fn failing_workflows_exit_1() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        "version: \"1.1\"\nsteps:\n  - name: A\n    command: \"false\"\n",
    )
    .expect("workflow");
    assert_eq!(cmd_run(dir.path(), &args(&["workflow.yaml", "--quiet"])), 1);
}

#[test]
fn clean_processed_is_refused_outside_the_workspace() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        concat!(
            "version: \"1.1\"\n",
            "processed_dir: \"../shared-processed\"\n",
            "steps:\n",
            "  - name: A\n",
            "    command: \"true\"\n",
        ),
    )
    .expect("workflow");

    let code = cmd_run(
        dir.path(),
        &args(&["workflow.yaml", "--clean-processed", "--quiet"]),
    );
    assert_eq!(code, 2);
}

#[test]
fn archive_destination_inside_processed_is_refused() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        "version: \"1.1\"\nsteps:\n  - name: A\n    command: \"true\"\n",
    )
    .expect("workflow");

    let code = cmd_run(
        dir.path(),
        &args(&[
            "workflow.yaml",
            "--archive-processed",
            "processed/archive.zip",
            "--quiet",
        ]),
    );
    assert_eq!(code, 2);
}

#[test]
fn resume_of_a_completed_run_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: Count\n",
            "    command: [\"sh\", \"-c\", \"echo ran >> count.txt\"]\n",
        ),
    )
    .expect("workflow");

    assert_eq!(cmd_run(dir.path(), &args(&["workflow.yaml", "--quiet"])), 0);
    let (run_id, _) = only_run_document(dir.path());

    assert_eq!(cmd_resume(dir.path(), &args(&[&run_id, "--quiet"])), 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("count.txt")).expect("count"),
        "ran\n",
        "resume of a completed run must not re-execute steps"
    );
}

#[test]
fn resume_refuses_an_edited_workflow_unless_forced() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        "version: \"1.1\"\nsteps:\n  - name: A\n    command: \"true\"\n",
    )
    .expect("workflow");
    assert_eq!(cmd_run(dir.path(), &args(&["workflow.yaml", "--quiet"])), 0);
    let (run_id, _) = only_run_document(dir.path());

    fs::write(
        dir.path().join("workflow.yaml"),
        "version: \"1.1\"\nsteps:\n  - name: A\n    command: \"echo changed\"\n",
    )
    .expect("edit workflow");

    assert_eq!(cmd_resume(dir.path(), &args(&[&run_id, "--quiet"])), 1);
    assert_eq!(
        cmd_resume(dir.path(), &args(&[&run_id, "--force-restart", "--quiet"])),
        0
    );
}

#[test]
fn resume_of_an_unknown_run_id_fails() {
    let dir = tempdir().expect("tempdir");
    assert_eq!(
        cmd_resume(dir.path(), &args(&["20250101T000000Z-zzzzzz", "--quiet"])),
        1
    );
}

#[test]
fn unknown_flags_exit_2() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        "version: \"1.1\"\nsteps:\n  - name: A\n    command: \"true\"\n",
    )
    .expect("workflow");
    assert_eq!(
        cmd_run(dir.path(), &args(&["workflow.yaml", "--frobnicate"])),
        2
    );
}

#[test]
fn debug_mode_writes_step_backups() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("workflow.yaml"),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: One\n",
            "    command: \"true\"\n",
            "  - name: Two\n",
            "    command: \"true\"\n",
        ),
    )
    .expect("workflow");

    assert_eq!(
        cmd_run(dir.path(), &args(&["workflow.yaml", "--backup-state", "--quiet"])),
        0
    );
    let (run_id, _) = only_run_document(dir.path());
    let run_root = dir.path().join(".orchestrate/runs").join(run_id);
    let backups: Vec<_> = fs::read_dir(&run_root)
        .expect("run root")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("state.json.step_"))
        .collect();
    assert!(
        !backups.is_empty(),
        "expected step backups in {run_root:?}"
    );
}
