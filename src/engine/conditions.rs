use crate::deps::resolver;
use crate::vars::{render_value, substitute, Scope};
use crate::workflow::WhenSpec;
use crate::workspace::{check_relative, Workspace};
use serde_json::Value;

/// Evaluates a `when` condition. Undefined variables make the condition
/// false rather than failing the step; malformed patterns are errors.
pub fn evaluate(
    when: &WhenSpec,
    scope: &Scope,
    workspace: &Workspace,
) -> Result<bool, String> {
    if let Some(equals) = &when.equals {
        let Some(left) = coerce_side(&equals.left, scope) else {
            return Ok(false);
        };
        let Some(right) = coerce_side(&equals.right, scope) else {
            return Ok(false);
        };
        return Ok(left == right);
    }
    if let Some(pattern) = &when.exists {
        return matches_exist(pattern, scope, workspace);
    }
    if let Some(pattern) = &when.not_exists {
        return matches_exist(pattern, scope, workspace).map(|found| !found);
    }
    Err("when requires one of `equals`, `exists`, `not_exists`".to_string())
}

/// Both comparison sides coerce to string form before comparing, so a JSON
/// boolean `true` equals the literal string "true".
fn coerce_side(value: &Value, scope: &Scope) -> Option<String> {
    match value {
        Value::String(text) => {
            let outcome = substitute(text, scope);
            if outcome.unresolved.is_empty() {
                Some(outcome.text)
            } else {
                None
            }
        }
        other => Some(render_value(other)),
    }
}

fn matches_exist(pattern: &str, scope: &Scope, workspace: &Workspace) -> Result<bool, String> {
    let outcome = substitute(pattern, scope);
    if !outcome.unresolved.is_empty() {
        return Ok(false);
    }
    check_relative(&outcome.text).map_err(|err| format!("unsafe condition pattern: {err}"))?;
    let matches = resolver::expand_one(workspace, &outcome.text)
        .map_err(|err| format!("condition pattern failed to expand: {err}"))?;
    Ok(!matches.is_empty())
}
