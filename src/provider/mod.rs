pub mod invocation;

pub use invocation::{build_invocation, Invocation, InvocationError};

use crate::workflow::{InputMode, ProviderTemplate};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const BUILTIN_PROVIDERS: [&str; 3] = ["claude", "gemini", "codex"];

pub fn is_builtin_provider(name: &str) -> bool {
    BUILTIN_PROVIDERS.contains(&name)
}

/// Templates declared in the workflow shadow the built-ins of the same name.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    templates: BTreeMap<String, ProviderTemplate>,
}

impl ProviderRegistry {
    pub fn with_builtins() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(
            "claude".to_string(),
            ProviderTemplate {
                command: vec![
                    "claude".to_string(),
                    "-p".to_string(),
                    "${PROMPT}".to_string(),
                    "--model".to_string(),
                    "${model}".to_string(),
                ],
                input_mode: InputMode::Argv,
                defaults: single_default("model", "claude-sonnet-4-20250514"),
            },
        );
        templates.insert(
            "gemini".to_string(),
            ProviderTemplate {
                command: vec![
                    "gemini".to_string(),
                    "-p".to_string(),
                    "${PROMPT}".to_string(),
                ],
                input_mode: InputMode::Argv,
                defaults: Map::new(),
            },
        );
        templates.insert(
            "codex".to_string(),
            ProviderTemplate {
                command: vec![
                    "codex".to_string(),
                    "exec".to_string(),
                    "--model".to_string(),
                    "${model}".to_string(),
                    "--dangerously-bypass-approvals-and-sandbox".to_string(),
                ],
                input_mode: InputMode::Stdin,
                defaults: single_default("model", "gpt-5"),
            },
        );
        Self { templates }
    }

    pub fn register_workflow_templates(
        &mut self,
        providers: &BTreeMap<String, ProviderTemplate>,
    ) {
        for (name, template) in providers {
            self.templates.insert(name.clone(), template.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProviderTemplate> {
        self.templates.get(name)
    }
}

fn single_default(key: &str, value: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), Value::String(value.to_string()));
    map
}

/// Template defaults overlaid by step `provider_params`; nested objects merge
/// recursively and the step side wins on conflicts.
pub fn merge_params(
    template: &ProviderTemplate,
    step_params: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut merged = template.defaults.clone();
    if let Some(step_params) = step_params {
        deep_merge(&mut merged, step_params);
    }
    merged
}

fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(base_child)), Value::Object(overlay_child)) => {
                deep_merge(base_child, overlay_child);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
