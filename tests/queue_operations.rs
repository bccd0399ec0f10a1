use orchestrate::queue::{
    clean_directory, list_tasks, move_task, validate_archive_destination, validate_clean_target,
    write_task, QueueError,
};
use orchestrate::workspace::Workspace;
use std::fs;
use tempfile::tempdir;

#[test]
fn write_task_leaves_no_tmp_file_behind() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let written =
        write_task(&workspace, "inbox/engineer/task_001.task", "do the thing\n").expect("write");
    assert_eq!(written, "inbox/engineer/task_001.task");
    assert_eq!(
        fs::read_to_string(dir.path().join("inbox/engineer/task_001.task")).expect("read"),
        "do the thing\n"
    );
    assert!(!dir.path().join("inbox/engineer/task_001.tmp").exists());
}

#[test]
fn move_task_places_files_under_a_timestamp_subdirectory() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");
    write_task(&workspace, "inbox/t.task", "x").expect("write");

    let moved = move_task(&workspace, "inbox/t.task", "processed", true).expect("move");
    assert!(moved.starts_with("processed/"));
    assert!(moved.ends_with("/t.task"));
    assert!(!dir.path().join("inbox/t.task").exists());
    assert!(dir.path().join(&moved).is_file());
}

#[test]
fn list_tasks_filters_by_extension_and_sorts() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");
    write_task(&workspace, "inbox/b.task", "x").expect("write b");
    write_task(&workspace, "inbox/a.task", "x").expect("write a");
    fs::write(dir.path().join("inbox/notes.md"), "x").expect("write noise");

    let tasks = list_tasks(&workspace, "inbox", ".task").expect("list");
    assert_eq!(tasks, vec!["inbox/a.task", "inbox/b.task"]);
}

#[test]
fn clean_refuses_targets_outside_the_workspace() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    assert!(matches!(
        validate_clean_target(&workspace, "../elsewhere"),
        Err(QueueError::Unsafe { .. })
    ));
    assert!(matches!(
        validate_clean_target(&workspace, "/tmp"),
        Err(QueueError::Unsafe { .. })
    ));
}

#[test]
fn clean_empties_the_directory_but_keeps_it() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");
    write_task(&workspace, "processed/a.task", "x").expect("write");
    fs::create_dir_all(dir.path().join("processed/nested")).expect("nested");

    let removed = clean_directory(&workspace, "processed").expect("clean");
    assert_eq!(removed, 2);
    assert!(dir.path().join("processed").is_dir());
    assert_eq!(
        fs::read_dir(dir.path().join("processed")).expect("read").count(),
        0
    );
}

#[test]
fn archive_destination_may_not_live_inside_processed() {
    let dir = tempdir().expect("tempdir");
    let processed = dir.path().join("processed");
    assert!(matches!(
        validate_archive_destination(&processed, &processed.join("archive.zip")),
        Err(QueueError::Refused { .. })
    ));
    validate_archive_destination(&processed, &dir.path().join("backups/archive.zip"))
        .expect("sibling destination is fine");
}
