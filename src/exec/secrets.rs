use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Resolved environment material for one step.
#[derive(Debug, Clone, Default)]
pub struct SecretsContext {
    /// Declared secret names absent from the orchestrator environment.
    pub missing: Vec<String>,
    /// Overlay applied on top of the inherited environment; step `env`
    /// entries have already won over secret values on key conflicts.
    pub overlay: BTreeMap<String, String>,
}

/// Tracks every secret value seen during a run so captured output, state,
/// and log lines can be masked. Masking is best-effort exact replacement,
/// longest value first.
#[derive(Debug, Clone, Default)]
pub struct SecretsVault {
    masked_values: BTreeSet<String>,
}

impl SecretsVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Secrets are sourced exclusively from the orchestrator environment; an
    /// empty string counts as present. Step `env` wins on key conflicts but
    /// conflicting values of declared secrets are still masked.
    pub fn resolve(
        &mut self,
        declared: &[String],
        step_env: &BTreeMap<String, String>,
    ) -> SecretsContext {
        let mut context = SecretsContext::default();

        for name in declared {
            match std::env::var(name) {
                Ok(value) => {
                    if !value.is_empty() {
                        self.masked_values.insert(value.clone());
                    }
                    context.overlay.insert(name.clone(), value);
                }
                Err(_) => context.missing.push(name.clone()),
            }
        }

        for (key, value) in step_env {
            if declared.contains(key) && !value.is_empty() {
                self.masked_values.insert(value.clone());
            }
            context.overlay.insert(key.clone(), value.clone());
        }

        context
    }

    pub fn mask_text(&self, text: &str) -> String {
        if self.masked_values.is_empty() {
            return text.to_string();
        }
        let mut masked = text.to_string();
        let mut values: Vec<&String> = self.masked_values.iter().collect();
        values.sort_by_key(|value| std::cmp::Reverse(value.len()));
        for value in values {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), "***");
            }
        }
        masked
    }

    pub fn mask_lines(&self, lines: &[String]) -> Vec<String> {
        lines.iter().map(|line| self.mask_text(line)).collect()
    }

    pub fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.mask_text(text)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.mask_value(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.mask_value(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
