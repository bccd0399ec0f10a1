use orchestrate::deps::{injector, resolver};
use orchestrate::vars::Scope;
use orchestrate::workflow::{DependsOn, InjectConfig, InjectMode, InjectPosition, InjectSpec};
use orchestrate::workspace::Workspace;
use serde_json::json;
use std::fs;
use tempfile::tempdir;

fn depends_on(required: &[&str], optional: &[&str]) -> DependsOn {
    let yaml = format!(
        "required: {:?}\noptional: {:?}\n",
        required.to_vec(),
        optional.to_vec()
    );
    serde_yaml::from_str(&yaml).expect("depends_on")
}

#[test]
fn matches_are_sorted_bytewise_and_deduplicated() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("data")).expect("mkdir");
    for name in ["b.csv", "a.csv", "c.csv"] {
        fs::write(dir.path().join("data").join(name), b"x").expect("write");
    }
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let resolution = resolver::resolve(
        &workspace,
        &depends_on(&["data/*.csv", "data/a.csv"], &[]),
        &Scope::new(),
    )
    .expect("resolve");

    assert!(resolution.is_satisfied());
    assert_eq!(
        resolution.files(),
        vec!["data/a.csv", "data/b.csv", "data/c.csv"]
    );
}

#[test]
fn required_miss_is_reported_optional_miss_is_silent() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let resolution = resolver::resolve(
        &workspace,
        &depends_on(&["data/missing.csv"], &["extra/*.txt"]),
        &Scope::new(),
    )
    .expect("resolve");

    assert!(!resolution.is_satisfied());
    assert_eq!(
        resolution.missing_required,
        vec!["data/missing.csv".to_string()]
    );
    assert!(resolution.optional.is_empty());
}

#[test]
fn patterns_substitute_loop_scope_before_expanding() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("inbox")).expect("mkdir");
    fs::write(dir.path().join("inbox/t1.task"), b"x").expect("write");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let scope = Scope::new().with_alias("task_file", json!("inbox/t1.task"));
    let resolution = resolver::resolve(
        &workspace,
        &depends_on(&["${task_file}"], &[]),
        &scope,
    )
    .expect("resolve");
    assert_eq!(resolution.files(), vec!["inbox/t1.task"]);
}

#[test]
fn hidden_files_match_only_with_explicit_dot_patterns() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("cfg")).expect("mkdir");
    fs::write(dir.path().join("cfg/.hidden"), b"x").expect("write");
    fs::write(dir.path().join("cfg/shown"), b"x").expect("write");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let wildcard = resolver::resolve(&workspace, &depends_on(&["cfg/*"], &[]), &Scope::new())
        .expect("resolve wildcard");
    assert_eq!(wildcard.files(), vec!["cfg/shown"]);

    let dotted = resolver::resolve(&workspace, &depends_on(&["cfg/.*"], &[]), &Scope::new())
        .expect("resolve dotted");
    assert_eq!(dotted.files(), vec!["cfg/.hidden"]);
}

#[cfg(unix)]
#[test]
fn symlinks_escaping_the_workspace_are_dropped() {
    let outer = tempdir().expect("outer");
    let dir = tempdir().expect("tempdir");
    fs::write(outer.path().join("leak.txt"), b"x").expect("write outside");
    fs::create_dir_all(dir.path().join("data")).expect("mkdir");
    std::os::unix::fs::symlink(
        outer.path().join("leak.txt"),
        dir.path().join("data/leak.txt"),
    )
    .expect("symlink");
    fs::write(dir.path().join("data/ok.txt"), b"x").expect("write inside");

    let workspace = Workspace::open(dir.path()).expect("workspace");
    let resolution = resolver::resolve(
        &workspace,
        &depends_on(&["data/*.txt"], &[]),
        &Scope::new(),
    )
    .expect("resolve");
    assert_eq!(resolution.files(), vec!["data/ok.txt"]);
}

#[test]
fn inject_shorthand_and_explicit_default_are_byte_identical() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");
    let required = vec!["data/a.csv".to_string(), "data/b.csv".to_string()];
    let optional = vec!["notes/hint.md".to_string()];

    let shorthand = injector::compose(
        &workspace,
        "Base prompt.",
        &required,
        &optional,
        &InjectSpec::Enabled(true).config(),
    );
    let explicit = injector::compose(
        &workspace,
        "Base prompt.",
        &required,
        &optional,
        &InjectConfig {
            mode: InjectMode::List,
            position: InjectPosition::Prepend,
            instruction: None,
        },
    );
    assert_eq!(shorthand.prompt, explicit.prompt);
}

#[test]
fn list_mode_lays_out_required_then_optional_sections() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");
    let outcome = injector::compose(
        &workspace,
        "Summarize the inputs.",
        &["data/a.csv".to_string()],
        &["notes/hint.md".to_string()],
        &InjectSpec::Enabled(true).config(),
    );

    let expected_block = concat!(
        "The following dependency files are available:\n",
        "Required:\n",
        "  - data/a.csv\n",
        "Optional (if available):\n",
        "  - notes/hint.md",
    );
    assert_eq!(
        outcome.prompt,
        format!("{expected_block}\n\nSummarize the inputs.")
    );
    assert!(outcome.truncation.is_none());
}

#[test]
fn append_position_places_block_after_the_prompt() {
    let dir = tempdir().expect("tempdir");
    let workspace = Workspace::open(dir.path()).expect("workspace");
    let outcome = injector::compose(
        &workspace,
        "Base.",
        &["data/a.csv".to_string()],
        &[],
        &InjectConfig {
            mode: InjectMode::List,
            position: InjectPosition::Append,
            instruction: Some("Inputs:".to_string()),
        },
    );
    assert!(outcome.prompt.starts_with("Base.\n\n"));
    assert!(outcome.prompt.ends_with("Inputs:\nRequired:\n  - data/a.csv"));
}

#[test]
fn content_mode_embeds_file_bodies_with_size_headers() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("data")).expect("mkdir");
    fs::write(dir.path().join("data/a.txt"), "alpha\n").expect("write");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let outcome = injector::compose(
        &workspace,
        "",
        &["data/a.txt".to_string()],
        &[],
        &InjectConfig {
            mode: InjectMode::Content,
            position: InjectPosition::Prepend,
            instruction: None,
        },
    );
    assert!(outcome.prompt.contains("=== File: data/a.txt (6/6) ==="));
    assert!(outcome.prompt.contains("alpha"));
}

#[test]
fn content_mode_truncates_at_the_cumulative_cap() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("data")).expect("mkdir");
    let big = "x".repeat(200 * 1024);
    fs::write(dir.path().join("data/one.txt"), &big).expect("write one");
    fs::write(dir.path().join("data/two.txt"), &big).expect("write two");
    fs::write(dir.path().join("data/zzz.txt"), &big).expect("write three");
    let workspace = Workspace::open(dir.path()).expect("workspace");

    let outcome = injector::compose(
        &workspace,
        "",
        &[
            "data/one.txt".to_string(),
            "data/two.txt".to_string(),
            "data/zzz.txt".to_string(),
        ],
        &[],
        &InjectConfig {
            mode: InjectMode::Content,
            position: InjectPosition::Prepend,
            instruction: None,
        },
    );

    assert!(outcome.prompt.len() <= injector::MAX_INJECTION_BYTES + 64);
    let details = outcome.truncation.expect("truncation details");
    assert_eq!(details.files_shown, 2);
    assert_eq!(details.files_truncated, 1);
    assert_eq!(details.files_omitted, 1);
    assert_eq!(details.total_size, 3 * 200 * 1024);
    assert!(details.shown_size < details.total_size);
}
