use crate::vars::{render_value, Scope};
use crate::workflow::{InputMode, ProviderTemplate};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("unresolved placeholders in provider template: {}", keys.join(", "))]
    MissingPlaceholders { keys: Vec<String> },
    #[error("${{PROMPT}} is not allowed in a stdin-mode provider template")]
    PromptInStdinTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub input_mode: InputMode,
    /// Delivered on the child's stdin for stdin-mode providers.
    pub stdin_prompt: Option<String>,
}

/// Assembles the child argv from a provider template. Escapes apply before
/// substitution; `${PROMPT}` is only legal in argv mode and is injected after
/// every other token so the prompt contents are never scanned for variables.
pub fn build_invocation(
    template: &ProviderTemplate,
    params: &Map<String, Value>,
    scope: &Scope,
    prompt: &str,
) -> Result<Invocation, InvocationError> {
    let mut argv = Vec::with_capacity(template.command.len());
    let mut missing = BTreeSet::new();

    for token in &template.command {
        argv.push(render_token(
            token,
            template.input_mode,
            params,
            scope,
            prompt,
            &mut missing,
        )?);
    }

    if !missing.is_empty() {
        return Err(InvocationError::MissingPlaceholders {
            keys: missing.into_iter().collect(),
        });
    }

    Ok(Invocation {
        argv,
        input_mode: template.input_mode,
        stdin_prompt: matches!(template.input_mode, InputMode::Stdin)
            .then(|| prompt.to_string()),
    })
}

fn render_token(
    token: &str,
    input_mode: InputMode,
    params: &Map<String, Value>,
    scope: &Scope,
    prompt: &str,
    missing: &mut BTreeSet<String>,
) -> Result<String, InvocationError> {
    let chars: Vec<char> = token.chars().collect();
    let mut out = String::with_capacity(token.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'$') {
            out.push('$');
            i += 2;
            continue;
        }
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') else {
                out.extend(&chars[i..]);
                break;
            };
            let key: String = chars[i + 2..i + 2 + close].iter().collect();
            i += close + 3;

            if key == "PROMPT" {
                if input_mode == InputMode::Stdin {
                    return Err(InvocationError::PromptInStdinTemplate);
                }
                out.push_str(prompt);
                continue;
            }
            if let Some(value) = params.get(&key) {
                out.push_str(&render_value(value));
                continue;
            }
            if let Some(value) = scope.lookup(&key) {
                out.push_str(&render_value(value));
                continue;
            }
            missing.insert(key);
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }

    Ok(out)
}
