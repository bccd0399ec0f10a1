use super::validate;
use super::Workflow;
use crate::workspace::Workspace;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub message: String,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to read workflow {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse workflow {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("workflow validation failed with {} error(s)", issues.len())]
    Validation { issues: Vec<ValidationIssue> },
}

impl WorkflowError {
    /// Every load failure is invalid input toward the exit-code contract.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub workflow: Workflow,
    /// `sha256:<hex>` over the raw workflow bytes; recomputed on resume to
    /// detect edits since the run started.
    pub checksum: String,
    /// Workspace-relative path of the source document.
    pub source: String,
}

pub fn load_workflow(workspace: &Workspace, path: &Path) -> Result<LoadedWorkflow, WorkflowError> {
    let bytes = fs::read(path).map_err(|source| WorkflowError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let checksum = checksum_bytes(&bytes);

    let workflow: Workflow =
        serde_yaml::from_slice(&bytes).map_err(|source| WorkflowError::Parse {
            path: path.display().to_string(),
            source,
        })?;

    let issues = validate::validate(&workflow);
    if !issues.is_empty() {
        return Err(WorkflowError::Validation { issues });
    }

    let source = match path.canonicalize() {
        Ok(absolute) => workspace.relative_display(&absolute),
        Err(_) => workspace.relative_display(path),
    };

    Ok(LoadedWorkflow {
        workflow,
        checksum,
        source,
    })
}

pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    Ok(checksum_bytes(&fs::read(path)?))
}

pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2 + 7);
    hex.push_str("sha256:");
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
