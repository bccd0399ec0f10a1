/// For-each iteration sources are parsed once into a typed pointer:
/// `steps.<Name>.lines` or `steps.<Name>.json[.<dotted>]`. Wildcards and
/// iteration indices are rejected at parse time.
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerField {
    Lines,
    Json { path: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemsPointer {
    pub step: String,
    pub field: PointerField,
}

impl ItemsPointer {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let rest = raw
            .strip_prefix("steps.")
            .ok_or_else(|| format!("pointer must start with `steps.`: {raw}"))?;
        let (step, field_path) = rest
            .split_once('.')
            .ok_or_else(|| format!("pointer must select `lines` or `json`: {raw}"))?;
        if step.is_empty() {
            return Err(format!("pointer is missing a step name: {raw}"));
        }
        if step.contains('[') || step.contains('*') {
            return Err(format!(
                "pointer may not reference loop iterations or wildcards: {raw}"
            ));
        }

        let mut segments = field_path.split('.');
        let field = match segments.next() {
            Some("lines") => {
                if segments.next().is_some() {
                    return Err(format!("`lines` does not support nested paths: {raw}"));
                }
                PointerField::Lines
            }
            Some("json") => {
                let path: Vec<String> = segments.map(str::to_string).collect();
                if path.iter().any(|seg| seg.is_empty() || seg.contains('*')) {
                    return Err(format!("invalid segment in json pointer path: {raw}"));
                }
                PointerField::Json { path }
            }
            _ => {
                return Err(format!(
                    "pointer field must be `lines` or `json`: {raw}"
                ))
            }
        };

        Ok(Self {
            step: step.to_string(),
            field,
        })
    }

    /// Resolves against the persisted `steps` map. The resolved value must be
    /// an array; type mismatches are reported for `invalid_reference` errors.
    pub fn resolve(&self, steps: &Value) -> Result<Vec<Value>, String> {
        let record = steps
            .get(&self.step)
            .ok_or_else(|| format!("step `{}` has no recorded result", self.step))?;
        let resolved = match &self.field {
            PointerField::Lines => record
                .get("lines")
                .ok_or_else(|| format!("step `{}` has no `lines` output", self.step))?,
            PointerField::Json { path } => {
                let mut current = record
                    .get("json")
                    .ok_or_else(|| format!("step `{}` has no `json` output", self.step))?;
                for segment in path {
                    current = match current {
                        Value::Object(map) => map.get(segment).ok_or_else(|| {
                            format!("json path segment `{segment}` not found for step `{}`", self.step)
                        })?,
                        _ => {
                            return Err(format!(
                                "json path segment `{segment}` applied to a non-object value"
                            ))
                        }
                    };
                }
                current
            }
        };
        match resolved {
            Value::Array(items) => Ok(items.clone()),
            other => Err(format!(
                "pointer must resolve to an array, got {}",
                type_name(other)
            )),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
