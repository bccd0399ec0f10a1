use super::load::ValidationIssue;
use super::pointers::ItemsPointer;
use super::{
    CaptureMode, CommandSpec, InputMode, Step, StepKind, WhenSpec, Workflow, WorkflowVersion,
};
use crate::provider::is_builtin_provider;
use crate::shared::ids::validate_step_name;
use crate::workspace::check_relative;
use serde_json::Value;
use std::collections::BTreeSet;

/// Strict validation pass over a parsed workflow. serde has already rejected
/// unknown fields; this layer enforces version gates, exclusivity, goto
/// targets, the `${env.*}` ban, and path safety on declared paths.
pub fn validate(workflow: &Workflow) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let version = workflow.version;

    if !version.is_supported() {
        let supported: Vec<String> = WorkflowVersion::SUPPORTED
            .iter()
            .map(WorkflowVersion::to_string)
            .collect();
        issues.push(ValidationIssue::new(format!(
            "unsupported version `{version}`; supported: {}",
            supported.join(", ")
        )));
    }

    for (index, secret) in workflow.secrets.iter().enumerate() {
        if secret.trim().is_empty() {
            issues.push(ValidationIssue::new(format!(
                "secrets[{index}] must be a non-empty environment variable name"
            )));
        }
    }

    for (name, template) in &workflow.providers {
        if template.command.is_empty() {
            issues.push(ValidationIssue::new(format!(
                "provider `{name}`: command must not be empty"
            )));
        }
        if template.input_mode == InputMode::Stdin
            && template.command.iter().any(|token| token.contains("${PROMPT}"))
        {
            issues.push(ValidationIssue::new(format!(
                "provider `{name}`: ${{PROMPT}} is not allowed in stdin input mode"
            )));
        }
    }

    for (label, value) in [
        ("inbox_dir", &workflow.inbox_dir),
        ("processed_dir", &workflow.processed_dir),
        ("failed_dir", &workflow.failed_dir),
    ] {
        if let Some(dir) = value {
            check_declared_path(&mut issues, label, dir);
        }
    }

    if workflow.steps.is_empty() {
        issues.push(ValidationIssue::new("`steps` must not be empty"));
    }

    let top_level: BTreeSet<&str> = workflow.steps.iter().map(|s| s.name.as_str()).collect();
    validate_steps(&mut issues, &workflow.steps, version, &top_level, None);
    issues.extend(validate_provider_references(workflow));

    issues
}

fn validate_steps(
    issues: &mut Vec<ValidationIssue>,
    steps: &[Step],
    version: WorkflowVersion,
    top_level: &BTreeSet<&str>,
    enclosing: Option<&BTreeSet<&str>>,
) {
    let mut seen = BTreeSet::new();

    for step in steps {
        let name = step.name.as_str();
        if let Err(err) = validate_step_name(name) {
            issues.push(ValidationIssue::new(format!("step `{name}`: {err}")));
        }
        if !seen.insert(name) {
            issues.push(ValidationIssue::new(format!(
                "duplicate step name `{name}` within one scope"
            )));
        }

        if step.command_override.is_some() {
            issues.push(ValidationIssue::new(format!(
                "step `{name}`: `command_override` is deprecated and no longer supported"
            )));
        }

        match step.kind() {
            Ok(kind) => validate_kind(issues, step, kind, version, top_level, enclosing),
            Err(err) => issues.push(ValidationIssue::new(format!("step `{name}`: {err}"))),
        }

        if let Some(depends_on) = &step.depends_on {
            if depends_on.inject.is_some() && version < WorkflowVersion::V1_1_1 {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: `depends_on.inject` requires version >= 1.1.1"
                )));
            }
            for pattern in depends_on.required.iter().chain(&depends_on.optional) {
                check_env_namespace(issues, &format!("step `{name}` depends_on"), pattern);
                check_declared_path(issues, &format!("step `{name}` depends_on"), pattern);
            }
        }

        if step.output_schema.is_some() || step.output_require.is_some() {
            if version < WorkflowVersion::V1_3 {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: `output_schema` / `output_require` require version >= 1.3"
                )));
            }
            if step.allow_parse_error {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: output contract fields are incompatible with `allow_parse_error: true`"
                )));
            }
            if step.output_capture != CaptureMode::Json {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: output contract fields require `output_capture: json`"
                )));
            }
        }

        for (index, secret) in step.secrets.iter().enumerate() {
            if secret.trim().is_empty() {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: secrets[{index}] must be a non-empty environment variable name"
                )));
            }
        }

        for (label, value) in [
            ("input_file", &step.input_file),
            ("output_file", &step.output_file),
        ] {
            if let Some(path) = value {
                check_env_namespace(issues, &format!("step `{name}` {label}"), path);
                check_declared_path(issues, &format!("step `{name}` {label}"), path);
            }
        }

        if let Some(when) = &step.when {
            validate_when(issues, name, when);
        }

        if let Some(handlers) = &step.on {
            let targets = [
                ("success", &handlers.success),
                ("failure", &handlers.failure),
                ("always", &handlers.always),
            ];
            for (handler, goto_spec) in targets {
                let Some(goto_spec) = goto_spec else { continue };
                let target = goto_spec.goto.as_str();
                let known = target == "_end"
                    || top_level.contains(target)
                    || enclosing.is_some_and(|scope| scope.contains(target));
                if !known {
                    issues.push(ValidationIssue::new(format!(
                        "step `{name}` on.{handler}.goto references unknown target `{target}`"
                    )));
                }
            }
        }

        if let Some(params) = &step.provider_params {
            if step.provider.is_none() {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: `provider_params` requires `provider`"
                )));
            }
            for value in params.values() {
                check_env_in_value(issues, &format!("step `{name}` provider_params"), value);
            }
        }
    }
}

fn validate_kind(
    issues: &mut Vec<ValidationIssue>,
    step: &Step,
    kind: StepKind<'_>,
    version: WorkflowVersion,
    top_level: &BTreeSet<&str>,
    enclosing: Option<&BTreeSet<&str>>,
) {
    let name = step.name.as_str();
    match kind {
        StepKind::Provider(_provider) => {}
        StepKind::Command(command) => match command {
            CommandSpec::Line(line) => {
                check_env_namespace(issues, &format!("step `{name}` command"), line);
                if line.trim().is_empty() {
                    issues.push(ValidationIssue::new(format!(
                        "step `{name}`: command must not be empty"
                    )));
                }
            }
            CommandSpec::Argv(argv) => {
                if argv.is_empty() {
                    issues.push(ValidationIssue::new(format!(
                        "step `{name}`: command must not be empty"
                    )));
                }
                for token in argv {
                    check_env_namespace(issues, &format!("step `{name}` command"), token);
                }
            }
        },
        StepKind::Wait(wait) => {
            check_env_namespace(issues, &format!("step `{name}` wait_for.glob"), &wait.glob);
            check_declared_path(issues, &format!("step `{name}` wait_for.glob"), &wait.glob);
            if wait.poll_ms == 0 {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: wait_for.poll_ms must be >= 1"
                )));
            }
        }
        StepKind::ForEach(for_each) => {
            if enclosing.is_some() {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: for_each may not be nested inside another for_each"
                )));
            }
            match (&for_each.items, &for_each.items_from) {
                (None, None) => issues.push(ValidationIssue::new(format!(
                    "step `{name}`: for_each requires `items` or `items_from`"
                ))),
                (Some(_), Some(_)) => issues.push(ValidationIssue::new(format!(
                    "step `{name}`: for_each cannot have both `items` and `items_from`"
                ))),
                (None, Some(pointer)) => {
                    if let Err(err) = ItemsPointer::parse(pointer) {
                        issues.push(ValidationIssue::new(format!(
                            "step `{name}`: invalid items_from pointer: {err}"
                        )));
                    }
                }
                (Some(_), None) => {}
            }
            if for_each.steps.is_empty() {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: for_each requires a non-empty `steps` list"
                )));
            }
            if for_each.on_item_complete.is_some() && version < WorkflowVersion::V1_2 {
                issues.push(ValidationIssue::new(format!(
                    "step `{name}`: `for_each.on_item_complete` requires version >= 1.2"
                )));
            }
            if let Some(lifecycle) = &for_each.on_item_complete {
                for (branch, action) in [
                    ("success", &lifecycle.success),
                    ("failure", &lifecycle.failure),
                ] {
                    if let Some(action) = action {
                        check_env_namespace(
                            issues,
                            &format!("step `{name}` on_item_complete.{branch}.move_to"),
                            &action.move_to,
                        );
                        check_declared_path(
                            issues,
                            &format!("step `{name}` on_item_complete.{branch}.move_to"),
                            &action.move_to,
                        );
                    }
                }
            }
            let siblings: BTreeSet<&str> =
                for_each.steps.iter().map(|s| s.name.as_str()).collect();
            validate_steps(issues, &for_each.steps, version, top_level, Some(&siblings));
        }
    }
}

fn validate_when(issues: &mut Vec<ValidationIssue>, name: &str, when: &WhenSpec) {
    let mut present = Vec::new();
    if when.equals.is_some() {
        present.push("equals");
    }
    if when.exists.is_some() {
        present.push("exists");
    }
    if when.not_exists.is_some() {
        present.push("not_exists");
    }
    match present.len() {
        0 => issues.push(ValidationIssue::new(format!(
            "step `{name}`: when requires one of `equals`, `exists`, `not_exists`"
        ))),
        1 => {}
        _ => issues.push(ValidationIssue::new(format!(
            "step `{name}`: when allows only one condition kind, found {}",
            present.join(", ")
        ))),
    }
    if let Some(equals) = &when.equals {
        check_env_in_value(issues, &format!("step `{name}` when.equals.left"), &equals.left);
        check_env_in_value(
            issues,
            &format!("step `{name}` when.equals.right"),
            &equals.right,
        );
    }
    for (label, pattern) in [("exists", &when.exists), ("not_exists", &when.not_exists)] {
        if let Some(pattern) = pattern {
            check_env_namespace(issues, &format!("step `{name}` when.{label}"), pattern);
            check_declared_path(issues, &format!("step `{name}` when.{label}"), pattern);
        }
    }
}

/// Declared paths still containing `${...}` are re-checked after substitution
/// at runtime; only literal paths can be gated at load time.
fn check_declared_path(issues: &mut Vec<ValidationIssue>, label: &str, raw: &str) {
    if raw.contains("${") {
        return;
    }
    if let Err(err) = check_relative(raw) {
        issues.push(ValidationIssue::new(format!("{label}: {err}")));
    }
}

fn check_env_namespace(issues: &mut Vec<ValidationIssue>, label: &str, raw: &str) {
    if raw.contains("${env.") {
        issues.push(ValidationIssue::new(format!(
            "{label}: the ${{env.*}} namespace is not allowed in workflows"
        )));
    }
}

fn check_env_in_value(issues: &mut Vec<ValidationIssue>, label: &str, value: &Value) {
    match value {
        Value::String(text) => check_env_namespace(issues, label, text),
        Value::Array(items) => {
            for item in items {
                check_env_in_value(issues, label, item);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                check_env_in_value(issues, label, item);
            }
        }
        _ => {}
    }
}

/// Unknown provider names fail at load when they are neither declared in the
/// workflow nor one of the built-in templates.
fn validate_provider_references(workflow: &Workflow) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut check = |step: &Step| {
        if let Some(provider) = &step.provider {
            if !workflow.providers.contains_key(provider) && !is_builtin_provider(provider) {
                issues.push(ValidationIssue::new(format!(
                    "step `{}` references unknown provider `{provider}`",
                    step.name
                )));
            }
        }
    };
    for step in &workflow.steps {
        check(step);
        if let Some(for_each) = &step.for_each {
            for nested in &for_each.steps {
                check(nested);
            }
        }
    }
    issues
}
