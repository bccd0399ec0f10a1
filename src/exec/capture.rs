use crate::state::ErrorRecord;
use crate::workflow::CaptureMode;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Retained bytes for text mode (and for raw text kept after a tolerated
/// JSON parse failure).
pub const TEXT_LIMIT_BYTES: usize = 8 * 1024;
/// Retained entries for lines mode.
pub const LINES_LIMIT: usize = 10_000;
/// Parse buffer ceiling for json mode.
pub const JSON_BUFFER_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CaptureRequest<'a> {
    pub step_name: &'a str,
    pub mode: CaptureMode,
    pub output_file: Option<&'a Path>,
    pub allow_parse_error: bool,
    pub logs_dir: &'a Path,
    pub output_schema: Option<&'a BTreeMap<String, String>>,
    pub output_require: Option<&'a [String]>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captured {
    /// Capture failures (json overflow / parse error) override the child's
    /// exit code with 2.
    pub exit_code_override: Option<i32>,
    pub output: Option<String>,
    pub lines: Option<Vec<String>>,
    pub json: Option<Value>,
    pub truncated: bool,
    pub error: Option<ErrorRecord>,
    pub debug: Option<Map<String, Value>>,
}

/// Runs the captured byte streams through the three-sink pipeline: the
/// optional `output_file` tee receives every byte, the in-memory buffer is
/// capped per mode, and overflow (or a JSON failure) spills the full stream
/// to `logs/<Step>.stdout`. Stderr lands in `logs/<Step>.stderr` iff
/// non-empty.
pub fn capture(
    request: &CaptureRequest<'_>,
    stdout: &[u8],
    stderr: &[u8],
) -> std::io::Result<Captured> {
    fs::create_dir_all(request.logs_dir)?;

    if !stderr.is_empty() {
        fs::write(
            request.logs_dir.join(format!("{}.stderr", request.step_name)),
            stderr,
        )?;
    }
    if let Some(output_file) = request.output_file {
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output_file, stdout)?;
    }

    let text = String::from_utf8_lossy(stdout).into_owned();
    match request.mode {
        CaptureMode::Text => capture_text(request, &text, stdout),
        CaptureMode::Lines => capture_lines(request, &text, stdout),
        CaptureMode::Json => capture_json(request, &text, stdout),
    }
}

fn spill_stdout(request: &CaptureRequest<'_>, stdout: &[u8]) -> std::io::Result<()> {
    fs::write(
        request.logs_dir.join(format!("{}.stdout", request.step_name)),
        stdout,
    )
}

fn truncate_to_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

fn capture_text(
    request: &CaptureRequest<'_>,
    text: &str,
    stdout: &[u8],
) -> std::io::Result<Captured> {
    if text.len() <= TEXT_LIMIT_BYTES {
        return Ok(Captured {
            output: Some(text.to_string()),
            ..Captured::default()
        });
    }
    spill_stdout(request, stdout)?;
    Ok(Captured {
        output: Some(truncate_to_boundary(text, TEXT_LIMIT_BYTES).to_string()),
        truncated: true,
        ..Captured::default()
    })
}

fn capture_lines(
    request: &CaptureRequest<'_>,
    text: &str,
    stdout: &[u8],
) -> std::io::Result<Captured> {
    let normalized = text.replace("\r\n", "\n");
    let mut lines: Vec<String> = normalized.split('\n').map(str::to_string).collect();
    if lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    if lines.len() <= LINES_LIMIT {
        return Ok(Captured {
            lines: Some(lines),
            ..Captured::default()
        });
    }
    spill_stdout(request, stdout)?;
    lines.truncate(LINES_LIMIT);
    Ok(Captured {
        lines: Some(lines),
        truncated: true,
        ..Captured::default()
    })
}

fn capture_json(
    request: &CaptureRequest<'_>,
    text: &str,
    stdout: &[u8],
) -> std::io::Result<Captured> {
    if stdout.len() > JSON_BUFFER_LIMIT {
        if request.allow_parse_error {
            return tolerated_parse_failure(request, text, stdout, "overflow");
        }
        return Ok(Captured {
            exit_code_override: Some(2),
            error: Some(
                ErrorRecord::new(format!(
                    "JSON buffer overflow: {} bytes exceeds the {JSON_BUFFER_LIMIT} byte limit",
                    stdout.len()
                ))
                .with_context("buffer_size", Value::from(stdout.len()))
                .with_context("limit", Value::from(JSON_BUFFER_LIMIT)),
            ),
            ..Captured::default()
        });
    }

    match serde_json::from_str::<Value>(text) {
        Ok(json) => {
            if let Some(error) = check_output_contract(request, &json) {
                return Ok(Captured {
                    exit_code_override: Some(2),
                    error: Some(error),
                    ..Captured::default()
                });
            }
            Ok(Captured {
                json: Some(json),
                ..Captured::default()
            })
        }
        Err(parse_error) => {
            if request.allow_parse_error {
                return tolerated_parse_failure(request, text, stdout, "invalid");
            }
            Ok(Captured {
                exit_code_override: Some(2),
                error: Some(ErrorRecord::new(format!(
                    "failed to parse JSON output: {parse_error}"
                ))),
                ..Captured::default()
            })
        }
    }
}

/// `allow_parse_error` keeps the step alive: raw text is stored under the
/// text cap, the parse failure moves to the debug block, and `json` stays
/// absent.
fn tolerated_parse_failure(
    request: &CaptureRequest<'_>,
    text: &str,
    stdout: &[u8],
    reason: &str,
) -> std::io::Result<Captured> {
    spill_stdout(request, stdout)?;
    let truncated = text.len() > TEXT_LIMIT_BYTES;
    let mut debug = Map::new();
    debug.insert(
        "json_parse_error".to_string(),
        serde_json::json!({ "reason": reason }),
    );
    Ok(Captured {
        exit_code_override: Some(0),
        output: Some(truncate_to_boundary(text, TEXT_LIMIT_BYTES).to_string()),
        truncated,
        debug: Some(debug),
        ..Captured::default()
    })
}

/// v1.3 output contract: `output_require` lists dotted paths that must
/// resolve in the parsed value; `output_schema` pins top-level key types.
fn check_output_contract(request: &CaptureRequest<'_>, json: &Value) -> Option<ErrorRecord> {
    if let Some(required_paths) = request.output_require {
        let missing: Vec<String> = required_paths
            .iter()
            .filter(|path| resolve_dotted(json, path).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Some(
                ErrorRecord::new(format!(
                    "JSON output is missing required paths: {}",
                    missing.join(", ")
                ))
                .with_context("output_require", Value::from(missing)),
            );
        }
    }
    if let Some(schema) = request.output_schema {
        for (key, expected) in schema {
            let Some(value) = json.get(key) else {
                return Some(
                    ErrorRecord::new(format!("JSON output is missing key `{key}`"))
                        .with_context("output_schema", Value::String(key.clone())),
                );
            };
            let actual = json_type_name(value);
            if actual != expected.as_str() {
                return Some(
                    ErrorRecord::new(format!(
                        "JSON output key `{key}` has type {actual}, expected {expected}"
                    ))
                    .with_context("output_schema", Value::String(key.clone())),
                );
            }
        }
    }
    None
}

fn resolve_dotted<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Last ten lines of a byte stream, for error records.
pub fn tail_lines(bytes: &[u8]) -> Option<Vec<String>> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<String> = text
        .lines()
        .rev()
        .take(10)
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Some(lines)
}
