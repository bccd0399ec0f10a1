use crate::workspace::{PathSafetyError, Workspace};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unsafe queue path: {source}")]
    Unsafe {
        #[from]
        source: PathSafetyError,
    },
    #[error("queue i/o failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to operate on {path}: {reason}")]
    Refused { path: String, reason: String },
    #[error("archive of {path} failed: {reason}")]
    Archive { path: String, reason: String },
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Atomic task drop per the queue convention: write `<name>.tmp` next to the
/// target, then rename into the final `*.task` name. Consumers never observe
/// a partial file.
pub fn write_task(
    workspace: &Workspace,
    target_rel: &str,
    content: &str,
) -> Result<String, QueueError> {
    let target = workspace.resolve(target_rel)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = target.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
    match fs::rename(&tmp, &target) {
        Ok(()) => Ok(workspace.relative_display(&target)),
        Err(source) => {
            let _ = fs::remove_file(&tmp);
            Err(io_err(&target, source))
        }
    }
}

/// Moves a task file into a lifecycle directory, under a UTC timestamp
/// subdirectory so repeated runs never collide.
pub fn move_task(
    workspace: &Workspace,
    source_rel: &str,
    dest_dir_rel: &str,
    timestamp_subdir: bool,
) -> Result<String, QueueError> {
    let source = workspace.resolve(source_rel)?;
    if !source.is_file() {
        return Err(io_err(
            &source,
            std::io::Error::new(std::io::ErrorKind::NotFound, "task file not found"),
        ));
    }
    let dest_base = workspace.resolve(dest_dir_rel)?;
    let dest_parent = if timestamp_subdir {
        dest_base.join(Utc::now().format("%Y%m%dT%H%M%S").to_string())
    } else {
        dest_base
    };
    fs::create_dir_all(&dest_parent).map_err(|e| io_err(&dest_parent, e))?;

    let file_name = source.file_name().ok_or_else(|| {
        io_err(
            &source,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "source has no file name"),
        )
    })?;
    let dest = dest_parent.join(file_name);
    fs::rename(&source, &dest).map_err(|e| io_err(&source, e))?;
    Ok(workspace.relative_display(&dest))
}

pub fn list_tasks(
    workspace: &Workspace,
    dir_rel: &str,
    extension: &str,
) -> Result<Vec<String>, QueueError> {
    let dir = workspace.resolve(dir_rel)?;
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut tasks = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
        let entry = entry.map_err(|e| io_err(&dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(extension) {
            tasks.push(workspace.relative_display(&path));
        }
    }
    tasks.sort();
    Ok(tasks)
}

/// `--clean-processed` safety: the directory must resolve inside the
/// workspace and must not be the workspace root itself.
pub fn validate_clean_target(workspace: &Workspace, dir_rel: &str) -> Result<PathBuf, QueueError> {
    let dir = workspace.resolve(dir_rel)?;
    if dir == workspace.root() {
        return Err(QueueError::Refused {
            path: dir.display().to_string(),
            reason: "cannot clean the workspace root".to_string(),
        });
    }
    Ok(dir)
}

pub fn clean_directory(workspace: &Workspace, dir_rel: &str) -> Result<usize, QueueError> {
    let dir = validate_clean_target(workspace, dir_rel)?;
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0usize;
    for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
        let entry = entry.map_err(|e| io_err(&dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
        } else {
            fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// `--archive-processed` safety: destinations inside the processed directory
/// would archive the archive on the next run.
pub fn validate_archive_destination(
    processed_abs: &Path,
    destination_abs: &Path,
) -> Result<(), QueueError> {
    if destination_abs.starts_with(processed_abs) {
        return Err(QueueError::Refused {
            path: destination_abs.display().to_string(),
            reason: "archive destination is inside the processed directory".to_string(),
        });
    }
    Ok(())
}

/// The zip writer is an external collaborator; this spawns the `zip` utility
/// the same way step timeouts spawn `kill`.
pub fn archive_directory(
    workspace: &Workspace,
    dir_rel: &str,
    destination_abs: &Path,
) -> Result<(), QueueError> {
    let dir = workspace.resolve(dir_rel)?;
    if !dir.is_dir() {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    if let Some(parent) = destination_abs.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let status = Command::new("zip")
        .arg("-r")
        .arg("-q")
        .arg(destination_abs)
        .arg(dir_rel)
        .current_dir(workspace.root())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| QueueError::Archive {
            path: dir.display().to_string(),
            reason: format!("failed to spawn zip: {source}"),
        })?;
    if !status.success() {
        return Err(QueueError::Archive {
            path: dir.display().to_string(),
            reason: format!("zip exited with {}", status.code().unwrap_or(-1)),
        });
    }
    Ok(())
}
