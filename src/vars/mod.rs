use serde_json::{Map, Value};

/// Immutable variable scope for one substitution site. Namespaces are plain
/// top-level keys (`run`, `context`, `steps`, `loop`) plus the loop item and
/// its alias; loop scopes are built by extending a clone of the parent scope
/// rather than mutating it.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    root: Map<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(mut self, run_id: &str, run_root: &str, timestamp_utc: &str) -> Self {
        let mut run = Map::new();
        run.insert("id".to_string(), Value::String(run_id.to_string()));
        run.insert("root".to_string(), Value::String(run_root.to_string()));
        run.insert(
            "timestamp_utc".to_string(),
            Value::String(timestamp_utc.to_string()),
        );
        self.root.insert("run".to_string(), Value::Object(run));
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.root.insert("context".to_string(), Value::Object(context));
        self
    }

    pub fn with_steps(mut self, steps: Value) -> Self {
        self.root.insert("steps".to_string(), steps);
        self
    }

    pub fn with_loop(mut self, index: usize, total: usize) -> Self {
        let mut entry = Map::new();
        entry.insert("index".to_string(), Value::from(index));
        entry.insert("total".to_string(), Value::from(total));
        self.root.insert("loop".to_string(), Value::Object(entry));
        self
    }

    pub fn with_alias(mut self, name: &str, value: Value) -> Self {
        self.root.insert(name.to_string(), value);
        self
    }

    /// Resolves a dotted path. Objects are indexed by key, arrays by integer
    /// segment. Wildcards are not supported.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substituted {
    pub text: String,
    pub unresolved: Vec<String>,
}

/// Conditional comparisons and scalar interpolation coerce values the same
/// way: booleans to `true`/`false`, numbers to their display form, and
/// compound values to compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Number(number) => number.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Single left-to-right pass. `$$` escapes to `$` first, which makes `$${`
/// the literal `${`. Unresolved placeholders stay in the output and are
/// reported as bare keys; the caller decides whether that is fatal.
pub fn substitute(input: &str, scope: &Scope) -> Substituted {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut unresolved = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'$') {
            out.push('$');
            i += 2;
            continue;
        }
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') else {
                // Unterminated token: copy the tail verbatim.
                out.extend(&chars[i..]);
                break;
            };
            let key: String = chars[i + 2..i + 2 + close].iter().collect();
            match scope.lookup(&key) {
                Some(value) => out.push_str(&render_value(value)),
                None => {
                    if !unresolved.contains(&key) {
                        unresolved.push(key.clone());
                    }
                    out.push_str(&format!("${{{key}}}"));
                }
            }
            i += close + 3;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }

    Substituted {
        text: out,
        unresolved,
    }
}

/// Substitution where any unresolved placeholder is an error; returns the
/// sorted bare keys on failure.
pub fn substitute_required(input: &str, scope: &Scope) -> Result<String, Vec<String>> {
    let outcome = substitute(input, scope);
    if outcome.unresolved.is_empty() {
        Ok(outcome.text)
    } else {
        let mut keys = outcome.unresolved;
        keys.sort();
        Err(keys)
    }
}

/// Recursive substitution over provider parameter values. Only strings are
/// substituted; arrays and objects recurse; other scalars pass through.
pub fn substitute_value(value: &Value, scope: &Scope) -> (Value, Vec<String>) {
    match value {
        Value::String(text) => {
            let outcome = substitute(text, scope);
            (Value::String(outcome.text), outcome.unresolved)
        }
        Value::Array(items) => {
            let mut unresolved = Vec::new();
            let substituted = items
                .iter()
                .map(|item| {
                    let (value, mut keys) = substitute_value(item, scope);
                    unresolved.append(&mut keys);
                    value
                })
                .collect();
            (Value::Array(substituted), unresolved)
        }
        Value::Object(map) => {
            let mut unresolved = Vec::new();
            let substituted = map
                .iter()
                .map(|(key, item)| {
                    let (value, mut keys) = substitute_value(item, scope);
                    unresolved.append(&mut keys);
                    (key.clone(), value)
                })
                .collect();
            (Value::Object(substituted), unresolved)
        }
        other => (other.clone(), Vec::new()),
    }
}
