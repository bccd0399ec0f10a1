use crate::workflow::{InjectConfig, InjectMode, InjectPosition};
use crate::workspace::Workspace;
use serde::Serialize;
use std::fs;

/// Cumulative budget for injected material across all files of one step.
pub const MAX_INJECTION_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TruncationDetails {
    pub total_size: usize,
    pub shown_size: usize,
    pub files_shown: usize,
    pub files_truncated: usize,
    pub files_omitted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionOutcome {
    pub prompt: String,
    pub truncation: Option<TruncationDetails>,
}

/// Builds the composed prompt from the base prompt plus resolved dependency
/// paths. Works entirely in memory; files on disk are never touched.
pub fn compose(
    workspace: &Workspace,
    base_prompt: &str,
    required: &[String],
    optional: &[String],
    config: &InjectConfig,
) -> InjectionOutcome {
    let (block, truncation) = match config.mode {
        InjectMode::None => {
            return InjectionOutcome {
                prompt: base_prompt.to_string(),
                truncation: None,
            }
        }
        InjectMode::List => list_block(required, optional, config.instruction.as_deref()),
        InjectMode::Content => content_block(
            workspace,
            required,
            optional,
            config.instruction.as_deref(),
        ),
    };

    let prompt = match (config.position, base_prompt.is_empty()) {
        (_, true) => block,
        (InjectPosition::Prepend, false) => format!("{block}\n\n{base_prompt}"),
        (InjectPosition::Append, false) => format!("{base_prompt}\n\n{block}"),
    };

    InjectionOutcome {
        prompt,
        truncation,
    }
}

fn default_instruction(mode: InjectMode) -> &'static str {
    match mode {
        InjectMode::List => "The following dependency files are available:",
        InjectMode::Content => "Content from dependency files:",
        InjectMode::None => "",
    }
}

fn list_block(
    required: &[String],
    optional: &[String],
    instruction: Option<&str>,
) -> (String, Option<TruncationDetails>) {
    let instruction = instruction
        .unwrap_or(default_instruction(InjectMode::List))
        .to_string();
    let mut lines = vec![instruction];
    if !required.is_empty() {
        lines.push("Required:".to_string());
        for path in required {
            lines.push(format!("  - {path}"));
        }
    }
    if !optional.is_empty() {
        lines.push("Optional (if available):".to_string());
        for path in optional {
            lines.push(format!("  - {path}"));
        }
    }

    let block = lines.join("\n");
    if block.len() <= MAX_INJECTION_BYTES {
        return (block, None);
    }

    // Rebuild line by line until the budget runs out.
    let total_files = required.len() + optional.len();
    let mut kept = Vec::new();
    let mut size = 0usize;
    let mut files_shown = 0usize;
    for line in lines {
        let line_size = line.len() + 1;
        if size + line_size > MAX_INJECTION_BYTES {
            break;
        }
        if line.starts_with("  - ") {
            files_shown += 1;
        }
        size += line_size;
        kept.push(line);
    }
    kept.push(format!(
        "  ... ({} files omitted)",
        total_files - files_shown
    ));
    let details = TruncationDetails {
        total_size: block.len(),
        shown_size: size,
        files_shown,
        files_truncated: 0,
        files_omitted: total_files - files_shown,
    };
    (kept.join("\n"), Some(details))
}

fn content_block(
    workspace: &Workspace,
    required: &[String],
    optional: &[String],
    instruction: Option<&str>,
) -> (String, Option<TruncationDetails>) {
    let instruction = instruction
        .unwrap_or(default_instruction(InjectMode::Content))
        .to_string();
    let mut sections = vec![instruction.clone()];
    let mut budget_used = instruction.len();
    let mut details = TruncationDetails::default();
    let mut truncated = false;

    let mut files: Vec<&String> = required.iter().chain(optional.iter()).collect();
    files.sort();
    files.dedup();

    for path in files {
        let absolute = workspace.root().join(path.as_str());
        // Optional dependencies may have vanished between resolve and read.
        let Ok(content) = fs::read_to_string(&absolute) else {
            continue;
        };
        let total = content.len();
        details.total_size += total;

        if truncated {
            details.files_omitted += 1;
            continue;
        }

        let header_reserve = format!("=== File: {path} ({total}/{total}) ===").len() + 2;
        let remaining = MAX_INJECTION_BYTES.saturating_sub(budget_used + header_reserve);

        if total <= remaining {
            sections.push(format!("=== File: {path} ({total}/{total}) ==="));
            sections.push(content);
            budget_used += header_reserve + total;
            details.files_shown += 1;
            details.shown_size += total;
            continue;
        }

        // The budget runs out mid-file; keep a char-boundary prefix.
        truncated = true;
        if remaining < 100 {
            details.files_omitted += 1;
            continue;
        }
        let mut cut = remaining;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        let shown = &content[..cut];
        sections.push(format!("=== File: {path} ({}/{total}) ===", shown.len()));
        sections.push(shown.to_string());
        sections.push("... (truncated)".to_string());
        budget_used += header_reserve + shown.len();
        details.files_shown += 1;
        details.files_truncated += 1;
        details.shown_size += shown.len();
    }

    let was_truncated = truncated || details.files_omitted > 0;
    (
        sections.join("\n"),
        was_truncated.then_some(details),
    )
}
