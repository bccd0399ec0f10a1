use orchestrate::exec::wait::wait_for_matches;
use orchestrate::shared::cancel::CancelToken;
use orchestrate::workspace::Workspace;
use std::fs;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn wait_succeeds_immediately_when_matches_exist() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("inbox/qa")).expect("mkdir");
    fs::write(dir.path().join("inbox/qa/r1.json"), b"{}").expect("write");
    fs::write(dir.path().join("inbox/qa/r2.json"), b"{}").expect("write");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let outcome = wait_for_matches(
        &workspace,
        "inbox/qa/*.json",
        Duration::from_secs(5),
        Duration::from_millis(50),
        2,
        &CancelToken::new(),
    );
    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.files, vec!["inbox/qa/r1.json", "inbox/qa/r2.json"]);
    assert!(outcome.wait_duration_ms >= 1);
    assert!(outcome.poll_count >= 1);
}

#[test]
fn wait_times_out_with_exit_124_and_empty_file_list() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let outcome = wait_for_matches(
        &workspace,
        "inbox/qa/*.json",
        Duration::from_secs(1),
        Duration::from_millis(100),
        1,
        &CancelToken::new(),
    );
    assert_eq!(outcome.exit_code, 124);
    assert!(outcome.timed_out);
    assert!(outcome.files.is_empty());
    assert!(outcome.poll_count >= 1);
    assert!(outcome.error.is_some());
}

#[test]
fn wait_rejects_unsafe_patterns_with_exit_2() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let absolute = wait_for_matches(
        &workspace,
        "/etc/*.conf",
        Duration::from_secs(1),
        Duration::from_millis(100),
        1,
        &CancelToken::new(),
    );
    assert_eq!(absolute.exit_code, 2);
    assert!(!absolute.timed_out);

    let traversal = wait_for_matches(
        &workspace,
        "../*.json",
        Duration::from_secs(1),
        Duration::from_millis(100),
        1,
        &CancelToken::new(),
    );
    assert_eq!(traversal.exit_code, 2);
}

#[test]
fn cancellation_aborts_the_wait_as_a_timeout() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");
    let cancel = CancelToken::new();
    cancel.cancel();

    let started = Instant::now();
    let outcome = wait_for_matches(
        &workspace,
        "inbox/*.task",
        Duration::from_secs(30),
        Duration::from_millis(500),
        1,
        &cancel,
    );
    assert_eq!(outcome.exit_code, 124);
    assert!(outcome.timed_out);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn wait_sees_files_created_while_polling() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("inbox")).expect("mkdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let target = dir.path().join("inbox/late.task");
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        fs::write(target, b"late").expect("late write");
    });

    let outcome = wait_for_matches(
        &workspace,
        "inbox/*.task",
        Duration::from_secs(10),
        Duration::from_millis(50),
        1,
        &CancelToken::new(),
    );
    writer.join().expect("writer thread");
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.files, vec!["inbox/late.task"]);
    assert!(outcome.poll_count >= 2);
}
