use orchestrate::engine::{ExecutionOptions, Interpreter};
use orchestrate::shared::cancel::CancelToken;
use orchestrate::shared::ids::generate_run_id;
use orchestrate::shared::logging::{LogLevel, RunLogger};
use orchestrate::state::{RunDocument, RunStatus, StateStore, StepEntry, StepStatus};
use orchestrate::workflow::load_workflow;
use orchestrate::workspace::Workspace;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn run(dir: &Path, yaml: &str) -> (RunStatus, RunDocument, StateStore) {
    fs::write(dir.join("workflow.yaml"), yaml).expect("write workflow");
    let workspace = Workspace::open(dir).expect("workspace");
    let loaded = load_workflow(&workspace, &dir.join("workflow.yaml")).expect("load workflow");

    let run_id = generate_run_id();
    let store = StateStore::new(workspace.root(), ".orchestrate", &run_id, false);
    let mut document = store
        .initialize(&run_id, &loaded.source, &loaded.checksum, loaded.workflow.context.clone())
        .expect("initialize");
    let logger = RunLogger::new(store.logs_dir(), LogLevel::Error, false);
    let mut interpreter = Interpreter::new(
        &loaded.workflow,
        &workspace,
        &store,
        &logger,
        CancelToken::new(),
        ExecutionOptions::default(),
    );
    let status = interpreter.execute(&mut document).expect("execute");
    (status, document, store)
}

fn loop_iterations<'a>(
    document: &'a RunDocument,
    name: &str,
) -> &'a [std::collections::BTreeMap<String, orchestrate::state::StepRecord>] {
    document
        .steps
        .get(name)
        .and_then(StepEntry::as_loop)
        .expect("loop entry")
}

#[test]
fn lines_capture_feeds_for_each_iterations() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("inbox")).expect("mkdir");
    fs::write(dir.path().join("inbox/a.task"), "alpha\n").expect("write a");
    fs::write(dir.path().join("inbox/b.task"), "bravo\n").expect("write b");

    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: List\n",
            "    command: \"find inbox -name *.task\"\n",
            "    output_capture: lines\n",
            "  - name: Process\n",
            "    for_each:\n",
            "      items_from: \"steps.List.lines\"\n",
            "      as: task_file\n",
            "      steps:\n",
            "        - name: Impl\n",
            "          command: \"cat ${task_file}\"\n",
        ),
    );
    assert_eq!(status, RunStatus::Completed);

    let listed = document.step("List").expect("List");
    let mut lines = listed.lines.clone().expect("lines");
    lines.sort();
    assert_eq!(lines, vec!["inbox/a.task", "inbox/b.task"]);

    let iterations = loop_iterations(&document, "Process");
    assert_eq!(iterations.len(), 2);
    for iteration in iterations {
        assert_eq!(iteration["Impl"].status, StepStatus::Completed);
    }

    let loop_state = document.for_each.get("Process").expect("loop state");
    assert_eq!(loop_state.completed_indices, vec![0, 1]);
}

#[test]
fn loop_scope_exposes_item_alias_index_and_total() {
    let dir = tempdir().expect("tempdir");
    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: Walk\n",
            "    for_each:\n",
            "      items: [\"red\", \"green\"]\n",
            "      as: color\n",
            "      steps:\n",
            "        - name: Show\n",
            "          command: \"echo ${loop.index}/${loop.total} ${color} ${item}\"\n",
        ),
    );
    assert_eq!(status, RunStatus::Completed);

    let iterations = loop_iterations(&document, "Walk");
    assert_eq!(
        iterations[0]["Show"].output.as_deref(),
        Some("0/2 red red\n")
    );
    assert_eq!(
        iterations[1]["Show"].output.as_deref(),
        Some("1/2 green green\n")
    );
}

#[test]
fn steps_namespace_inside_a_loop_sees_only_the_current_iteration() {
    let dir = tempdir().expect("tempdir");
    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: Outer\n",
            "    command: \"echo outer-value\"\n",
            "  - name: Walk\n",
            "    for_each:\n",
            "      items: [\"one\"]\n",
            "      steps:\n",
            "        - name: First\n",
            "          command: \"echo from-first\"\n",
            "        - name: Second\n",
            "          command: \"echo saw ${steps.First.output}\"\n",
        ),
    );
    assert_eq!(status, RunStatus::Completed);
    let iterations = loop_iterations(&document, "Walk");
    assert_eq!(
        iterations[0]["Second"].output.as_deref(),
        Some("saw from-first\n")
    );
}

#[test]
fn items_from_must_resolve_to_an_array() {
    let dir = tempdir().expect("tempdir");
    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: Parse\n",
            "    command: [\"sh\", \"-c\", \"echo '{\\\"count\\\": 3}'\"]\n",
            "    output_capture: json\n",
            "  - name: Walk\n",
            "    for_each:\n",
            "      items_from: \"steps.Parse.json.count\"\n",
            "      steps:\n",
            "        - name: Child\n",
            "          command: \"true\"\n",
        ),
    );
    assert_eq!(status, RunStatus::Failed);
    let walk = document.step("Walk").expect("Walk record");
    assert_eq!(walk.exit_code, Some(2));
    assert!(walk
        .error
        .as_ref()
        .expect("error")
        .context
        .contains_key("invalid_reference"));
}

#[test]
fn sibling_goto_jumps_within_the_iteration() {
    let dir = tempdir().expect("tempdir");
    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: Walk\n",
            "    for_each:\n",
            "      items: [\"only\"]\n",
            "      steps:\n",
            "        - name: Try\n",
            "          command: \"false\"\n",
            "          on:\n",
            "            failure:\n",
            "              goto: Cleanup\n",
            "        - name: Middle\n",
            "          command: [\"sh\", \"-c\", \"touch middle.txt\"]\n",
            "        - name: Cleanup\n",
            "          command: \"echo cleaned\"\n",
        ),
    );
    assert_eq!(status, RunStatus::Completed);
    let iterations = loop_iterations(&document, "Walk");
    assert_eq!(iterations[0]["Cleanup"].status, StepStatus::Completed);
    assert!(!iterations[0].contains_key("Middle"));
    assert!(!dir.path().join("middle.txt").exists());
}

#[test]
fn goto_end_escapes_the_loop_and_completes_the_run() {
    let dir = tempdir().expect("tempdir");
    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.1\"\n",
            "steps:\n",
            "  - name: Walk\n",
            "    for_each:\n",
            "      items: [\"first\", \"second\", \"third\"]\n",
            "      steps:\n",
            "        - name: Check\n",
            "          command: \"echo ${item}\"\n",
            "          on:\n",
            "            success:\n",
            "              goto: _end\n",
            "  - name: After\n",
            "    command: [\"sh\", \"-c\", \"touch after.txt\"]\n",
        ),
    );
    assert_eq!(status, RunStatus::Completed);
    let iterations = loop_iterations(&document, "Walk");
    assert_eq!(iterations.len(), 1, "escape stops later iterations");
    assert!(!dir.path().join("after.txt").exists());
}

#[test]
fn lifecycle_moves_task_files_per_iteration_outcome() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("inbox")).expect("mkdir");
    fs::write(dir.path().join("inbox/good.task"), "ok\n").expect("write good");
    fs::write(dir.path().join("inbox/bad.task"), "broken\n").expect("write bad");

    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.2\"\n",
            "strict_flow: false\n",
            "steps:\n",
            "  - name: Drain\n",
            "    for_each:\n",
            "      items: [\"inbox/bad.task\", \"inbox/good.task\"]\n",
            "      as: task_file\n",
            "      steps:\n",
            "        - name: Handle\n",
            "          command: [\"sh\", \"-c\", \"grep -q ok ${task_file}\"]\n",
            "      on_item_complete:\n",
            "        success:\n",
            "          move_to: \"processed\"\n",
            "        failure:\n",
            "          move_to: \"failed\"\n",
        ),
    );
    assert_eq!(status, RunStatus::Completed);

    assert!(!dir.path().join("inbox/good.task").exists());
    assert!(!dir.path().join("inbox/bad.task").exists());
    assert!(dir.path().join("processed/good.task").exists());
    assert!(dir.path().join("failed/bad.task").exists());

    let loop_state = document.for_each.get("Drain").expect("loop state");
    assert_eq!(loop_state.lifecycle.len(), 2);
    assert!(loop_state.lifecycle.iter().all(|record| record.action_applied));
}

#[test]
fn lifecycle_missing_source_records_an_error_without_failing_the_loop() {
    let dir = tempdir().expect("tempdir");
    let (status, document, _) = run(
        dir.path(),
        concat!(
            "version: \"1.2\"\n",
            "steps:\n",
            "  - name: Drain\n",
            "    for_each:\n",
            "      items: [\"inbox/ghost.task\"]\n",
            "      as: task_file\n",
            "      steps:\n",
            "        - name: Handle\n",
            "          command: \"echo ${task_file}\"\n",
            "      on_item_complete:\n",
            "        success:\n",
            "          move_to: \"processed\"\n",
        ),
    );
    assert_eq!(status, RunStatus::Completed);
    let loop_state = document.for_each.get("Drain").expect("loop state");
    let record = &loop_state.lifecycle[0];
    assert!(!record.action_applied);
    assert!(record.error.as_ref().expect("error").contains("not found"));
}
