use crate::shared::fs_atomic::{atomic_write_file, copy_file};
use crate::shared::ids::now_utc_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: &str = "1.1.1";
const MAX_STEP_BACKUPS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read state {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write state {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state document {path} is corrupted: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no usable backup found under {path}")]
    NoUsableBackup { path: String },
    #[error("run state not found at {path}")]
    Missing { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<Vec<String>>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Persisted outcome of one step execution. Mode-dependent output fields are
/// omitted when absent so the document mirrors exactly what was captured:
/// `output` only in text mode, `lines` only in lines mode, `json` only in
/// json mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Map<String, Value>>,
}

impl StepRecord {
    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            exit_code: Some(0),
            skipped: true,
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, error: ErrorRecord) -> Self {
        Self {
            status: StepStatus::Failed,
            exit_code: Some(exit_code),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(0)
    }
}

/// A top-level entry is either one step result or, for a loop, the array of
/// per-iteration child maps. Child names never leak into the top-level map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    Single(StepRecord),
    Loop(Vec<BTreeMap<String, StepRecord>>),
}

impl StepEntry {
    pub fn as_single(&self) -> Option<&StepRecord> {
        match self {
            Self::Single(record) => Some(record),
            Self::Loop(_) => None,
        }
    }

    pub fn as_loop(&self) -> Option<&[BTreeMap<String, StepRecord>]> {
        match self {
            Self::Single(_) => None,
            Self::Loop(iterations) => Some(iterations),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub index: usize,
    pub action_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForEachState {
    pub items: Vec<Value>,
    #[serde(default)]
    pub completed_indices: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lifecycle: Vec<LifecycleRecord>,
}

impl ForEachState {
    pub fn lifecycle_applied(&self, index: usize) -> bool {
        self.lifecycle
            .iter()
            .any(|record| record.index == index && record.action_applied)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDocument {
    pub schema_version: String,
    pub run_id: String,
    pub workflow_file: String,
    pub workflow_checksum: String,
    pub started_at: String,
    pub updated_at: String,
    pub status: RunStatus,
    /// Workspace-relative run directory.
    pub run_root: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepEntry>,
    #[serde(default)]
    pub for_each: BTreeMap<String, ForEachState>,
}

impl RunDocument {
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.get(name).and_then(StepEntry::as_single)
    }

    pub fn steps_value(&self) -> Value {
        serde_json::to_value(&self.steps).unwrap_or(Value::Object(Map::new()))
    }
}

/// Owns the on-disk layout of one run. Every persist is write-to-temp plus
/// atomic rename; step backups are plain copies rotated to the newest three.
#[derive(Debug, Clone)]
pub struct StateStore {
    run_root: PathBuf,
    run_root_rel: String,
    state_file: PathBuf,
    logs_dir: PathBuf,
    artifacts_dir: PathBuf,
    backups_enabled: bool,
}

impl StateStore {
    pub fn new(
        workspace_root: &Path,
        state_dir_rel: &str,
        run_id: &str,
        backups_enabled: bool,
    ) -> Self {
        let run_root_rel = format!("{state_dir_rel}/runs/{run_id}");
        let run_root = workspace_root.join(&run_root_rel);
        Self {
            state_file: run_root.join("state.json"),
            logs_dir: run_root.join("logs"),
            artifacts_dir: run_root.join("artifacts"),
            run_root,
            run_root_rel,
            backups_enabled,
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn run_root_rel(&self) -> &str {
        &self.run_root_rel
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn exists(&self) -> bool {
        self.state_file.is_file()
    }

    pub fn initialize(
        &self,
        run_id: &str,
        workflow_file: &str,
        workflow_checksum: &str,
        context: Map<String, Value>,
    ) -> Result<RunDocument, StateError> {
        for dir in [&self.run_root, &self.logs_dir, &self.artifacts_dir] {
            fs::create_dir_all(dir).map_err(|source| StateError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let now = now_utc_rfc3339();
        let mut document = RunDocument {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            workflow_file: workflow_file.to_string(),
            workflow_checksum: workflow_checksum.to_string(),
            started_at: now.clone(),
            updated_at: now,
            status: RunStatus::Running,
            run_root: self.run_root_rel.clone(),
            context,
            steps: BTreeMap::new(),
            for_each: BTreeMap::new(),
        };
        self.persist(&mut document)?;
        Ok(document)
    }

    pub fn load(&self) -> Result<RunDocument, StateError> {
        if !self.state_file.is_file() {
            return Err(StateError::Missing {
                path: self.state_file.display().to_string(),
            });
        }
        let raw = fs::read(&self.state_file).map_err(|source| StateError::Read {
            path: self.state_file.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| StateError::Corrupt {
            path: self.state_file.display().to_string(),
            source,
        })
    }

    pub fn persist(&self, document: &mut RunDocument) -> Result<(), StateError> {
        document.updated_at = now_utc_rfc3339();
        let mut body = serde_json::to_vec_pretty(document).map_err(|source| StateError::Corrupt {
            path: self.state_file.display().to_string(),
            source,
        })?;
        body.push(b'\n');
        atomic_write_file(&self.state_file, &body).map_err(|source| StateError::Write {
            path: self.state_file.display().to_string(),
            source,
        })
    }

    pub fn update_step(
        &self,
        document: &mut RunDocument,
        name: &str,
        record: StepRecord,
    ) -> Result<(), StateError> {
        document
            .steps
            .insert(name.to_string(), StepEntry::Single(record));
        self.persist(document)
    }

    /// Iteration results are written in index order; earlier iterations are
    /// preserved on partial resume.
    pub fn update_loop_iteration(
        &self,
        document: &mut RunDocument,
        loop_name: &str,
        index: usize,
        iteration: BTreeMap<String, StepRecord>,
    ) -> Result<(), StateError> {
        let entry = document
            .steps
            .entry(loop_name.to_string())
            .or_insert_with(|| StepEntry::Loop(Vec::new()));
        if !matches!(entry, StepEntry::Loop(_)) {
            *entry = StepEntry::Loop(Vec::new());
        }
        if let StepEntry::Loop(iterations) = entry {
            while iterations.len() <= index {
                iterations.push(BTreeMap::new());
            }
            iterations[index] = iteration;
        }
        self.persist(document)
    }

    pub fn update_for_each(
        &self,
        document: &mut RunDocument,
        loop_name: &str,
        state: ForEachState,
    ) -> Result<(), StateError> {
        document.for_each.insert(loop_name.to_string(), state);
        self.persist(document)
    }

    pub fn update_status(
        &self,
        document: &mut RunDocument,
        status: RunStatus,
    ) -> Result<(), StateError> {
        document.status = status;
        self.persist(document)
    }

    /// Copies the previous document aside before a step executes. Backup file
    /// names carry the step so operators can line them up with the log.
    pub fn backup_before_step(&self, step_name: &str) -> Result<(), StateError> {
        if !self.backups_enabled || !self.state_file.is_file() {
            return Ok(());
        }
        let backup = self
            .run_root
            .join(format!("state.json.step_{step_name}.bak"));
        copy_file(&self.state_file, &backup).map_err(|source| StateError::Write {
            path: backup.display().to_string(),
            source,
        })?;
        self.rotate_backups()
    }

    fn rotate_backups(&self) -> Result<(), StateError> {
        let mut backups = self.list_backups()?;
        while backups.len() > MAX_STEP_BACKUPS {
            let (oldest, _) = backups.remove(0);
            let _ = fs::remove_file(oldest);
        }
        Ok(())
    }

    fn list_backups(&self) -> Result<Vec<(PathBuf, std::time::SystemTime)>, StateError> {
        let mut backups = Vec::new();
        let entries = fs::read_dir(&self.run_root).map_err(|source| StateError::Read {
            path: self.run_root.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StateError::Read {
                path: self.run_root.display().to_string(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("state.json.step_") || !name.ends_with(".bak") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            backups.push((entry.path(), modified));
        }
        backups.sort_by(|(a_path, a_time), (b_path, b_time)| {
            a_time.cmp(b_time).then_with(|| a_path.cmp(b_path))
        });
        Ok(backups)
    }

    /// Best-effort rollback: restore the newest backup that still parses.
    pub fn attempt_repair(&self) -> Result<RunDocument, StateError> {
        let mut backups = self.list_backups()?;
        backups.reverse();
        for (backup, _) in backups {
            let Ok(raw) = fs::read(&backup) else { continue };
            let Ok(document) = serde_json::from_slice::<RunDocument>(&raw) else {
                continue;
            };
            copy_file(&backup, &self.state_file).map_err(|source| StateError::Write {
                path: self.state_file.display().to_string(),
                source,
            })?;
            return Ok(document);
        }
        Err(StateError::NoUsableBackup {
            path: self.run_root.display().to_string(),
        })
    }
}
