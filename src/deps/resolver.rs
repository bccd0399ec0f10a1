use crate::vars::{substitute, Scope};
use crate::workflow::DependsOn;
use crate::workspace::{check_relative, PathSafetyError, Workspace};
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("undefined variables in dependency pattern `{pattern}`: {}", vars.join(", "))]
    UndefinedVars { pattern: String, vars: Vec<String> },
    #[error("unsafe dependency pattern `{pattern}`: {source}")]
    Unsafe {
        pattern: String,
        #[source]
        source: PathSafetyError,
    },
    #[error("invalid glob pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    /// Substituted required patterns that matched nothing.
    pub missing_required: Vec<String>,
}

impl Resolution {
    pub fn is_satisfied(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// All matches, deduplicated, in ascending bytewise order.
    pub fn files(&self) -> Vec<String> {
        let merged: BTreeSet<&String> = self.required.iter().chain(&self.optional).collect();
        merged.into_iter().cloned().collect()
    }

    pub fn any_optional(&self) -> bool {
        !self.optional.is_empty()
    }
}

/// Expands `depends_on` globs relative to the workspace. Patterns are
/// substituted first (loop scope included), gated for path safety, then
/// expanded with POSIX `*` / `?` semantics; globstar is not supported.
/// Matches whose real target escapes the workspace are dropped.
pub fn resolve(
    workspace: &Workspace,
    depends_on: &DependsOn,
    scope: &Scope,
) -> Result<Resolution, ResolveError> {
    let mut resolution = Resolution::default();
    resolution.required = expand_patterns(
        workspace,
        &depends_on.required,
        scope,
        Some(&mut resolution.missing_required),
    )?;
    resolution.optional = expand_patterns(workspace, &depends_on.optional, scope, None)?;
    Ok(resolution)
}

fn expand_patterns(
    workspace: &Workspace,
    patterns: &[String],
    scope: &Scope,
    mut missing: Option<&mut Vec<String>>,
) -> Result<Vec<String>, ResolveError> {
    let mut matches = Vec::new();
    for pattern in patterns {
        let substituted = substitute(pattern, scope);
        if !substituted.unresolved.is_empty() {
            return Err(ResolveError::UndefinedVars {
                pattern: pattern.clone(),
                vars: substituted.unresolved,
            });
        }
        let expanded = expand_one(workspace, &substituted.text)?;
        if expanded.is_empty() {
            if let Some(missing) = missing.as_deref_mut() {
                missing.push(substituted.text);
            }
            continue;
        }
        matches.extend(expanded);
    }
    matches.sort();
    matches.dedup();
    Ok(matches)
}

pub(crate) fn expand_one(
    workspace: &Workspace,
    pattern: &str,
) -> Result<Vec<String>, ResolveError> {
    check_relative(pattern).map_err(|source| ResolveError::Unsafe {
        pattern: pattern.to_string(),
        source,
    })?;

    // POSIX semantics: hidden names match only when the pattern component
    // itself starts with a dot.
    let options = glob::MatchOptions {
        require_literal_leading_dot: true,
        ..glob::MatchOptions::new()
    };
    let absolute = workspace.root().join(pattern);
    let paths = glob::glob_with(&absolute.to_string_lossy(), options).map_err(|source| {
        ResolveError::Pattern {
            pattern: pattern.to_string(),
            source,
        }
    })?;

    let mut matches = Vec::new();
    for entry in paths {
        let Ok(path) = entry else { continue };
        let Some(relative) = workspace.contain(&path) else {
            continue;
        };
        matches.push(relative.to_string_lossy().into_owned());
    }
    matches.sort();
    Ok(matches)
}
