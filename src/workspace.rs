use crate::shared::fs_atomic::canonicalize_existing;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathSafetyError {
    #[error("path must be non-empty")]
    Empty,
    #[error("absolute paths are not allowed: {path}")]
    Absolute { path: String },
    #[error("parent directory traversal ('..') is not allowed: {path}")]
    ParentTraversal { path: String },
    #[error("path escapes the workspace: {path}")]
    EscapesWorkspace { path: String },
    #[error("failed to resolve {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lexical half of the gate. Applied to every declared path at load time and
/// to every substituted path again before filesystem access.
pub fn check_relative(raw: &str) -> Result<(), PathSafetyError> {
    if raw.trim().is_empty() {
        return Err(PathSafetyError::Empty);
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(PathSafetyError::Absolute {
            path: raw.to_string(),
        });
    }
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(PathSafetyError::ParentTraversal {
                    path: raw.to_string(),
                })
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathSafetyError::Absolute {
                    path: raw.to_string(),
                })
            }
            _ => {}
        }
    }
    Ok(())
}

/// Root directory against which all declared paths resolve. The root is
/// canonicalized once so symlink containment checks compare real paths.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn open(root: &Path) -> Result<Self, PathSafetyError> {
        let root = canonicalize_existing(root).map_err(|source| PathSafetyError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a workspace-relative path to an absolute one. If the target
    /// already exists, symlinks are followed and the real target must stay
    /// under the workspace root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, PathSafetyError> {
        check_relative(raw)?;
        let joined = self.root.join(raw);
        if joined.symlink_metadata().is_ok() {
            let real = canonicalize_existing(&joined).map_err(|source| PathSafetyError::Io {
                path: raw.to_string(),
                source,
            })?;
            if !real.starts_with(&self.root) {
                return Err(PathSafetyError::EscapesWorkspace {
                    path: raw.to_string(),
                });
            }
        }
        Ok(joined)
    }

    /// Containment check for paths produced by glob expansion. Returns the
    /// workspace-relative form of `candidate`, or None when its real target
    /// escapes the workspace.
    pub fn contain(&self, candidate: &Path) -> Option<PathBuf> {
        let real = canonicalize_existing(candidate).ok()?;
        if !real.starts_with(&self.root) {
            return None;
        }
        candidate
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .ok()
    }

    pub fn relative_display(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .display()
            .to_string()
    }
}
