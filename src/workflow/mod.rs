pub mod load;
pub mod pointers;
pub mod validate;

pub use load::{load_workflow, LoadedWorkflow, WorkflowError};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Workflow versions gate DSL features. `1.1` is the baseline; `1.1.1` adds
/// `depends_on.inject`; `1.2` adds `for_each.on_item_complete`; `1.3` adds
/// the output contract fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkflowVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl WorkflowVersion {
    pub const V1_1: Self = Self::new(1, 1, 0);
    pub const V1_1_1: Self = Self::new(1, 1, 1);
    pub const V1_2: Self = Self::new(1, 2, 0);
    pub const V1_3: Self = Self::new(1, 3, 0);

    pub const SUPPORTED: [Self; 4] = [Self::V1_1, Self::V1_1_1, Self::V1_2, Self::V1_3];

    const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = raw.split('.');
        let mut next = |label: &str| -> Result<u32, String> {
            parts
                .next()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| format!("version is missing its {label} component"))?
                .parse::<u32>()
                .map_err(|_| format!("version {label} component must be an integer"))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = match parts.next() {
            Some(raw_patch) => raw_patch
                .trim()
                .parse::<u32>()
                .map_err(|_| "version patch component must be an integer".to_string())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err("version has too many components".to_string());
        }
        Ok(Self::new(major, minor, patch))
    }

    pub fn is_supported(self) -> bool {
        Self::SUPPORTED.contains(&self)
    }
}

impl std::fmt::Display for WorkflowVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

impl<'de> Deserialize<'de> for WorkflowVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(|err| D::Error::custom(format!("invalid version `{raw}`: {err}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    Argv,
    Stdin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderTemplate {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_mode: InputMode,
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    Text,
    Lines,
    Json,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Lines => "lines",
            Self::Json => "json",
        }
    }
}

/// Raw commands accept either a single string (tokenized with shell-style
/// quoting, no shell is spawned) or an explicit argv list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForSpec {
    pub glob: String,
    #[serde(default = "default_wait_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default = "default_wait_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_wait_min_count")]
    pub min_count: usize,
}

fn default_wait_timeout_sec() -> u64 {
    300
}

fn default_wait_poll_ms() -> u64 {
    500
}

fn default_wait_min_count() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependsOn {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub inject: Option<InjectSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum InjectSpec {
    Enabled(bool),
    Config(InjectConfig),
}

impl InjectSpec {
    pub fn is_active(&self) -> bool {
        match self {
            Self::Enabled(enabled) => *enabled,
            Self::Config(config) => config.mode != InjectMode::None,
        }
    }

    /// `inject: true` is shorthand for list mode prepended with the default
    /// instruction.
    pub fn config(&self) -> InjectConfig {
        match self {
            Self::Enabled(_) => InjectConfig::default(),
            Self::Config(config) => config.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectConfig {
    #[serde(default)]
    pub mode: InjectMode,
    #[serde(default)]
    pub position: InjectPosition,
    #[serde(default)]
    pub instruction: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectMode {
    #[default]
    List,
    Content,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectPosition {
    #[default]
    Prepend,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RetriesSpec {
    Max(u32),
    Config(RetriesConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetriesConfig {
    pub max: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

pub fn default_retry_delay_ms() -> u64 {
    1000
}

impl RetriesSpec {
    pub fn max(&self) -> u32 {
        match self {
            Self::Max(max) => *max,
            Self::Config(config) => config.max,
        }
    }

    pub fn delay_ms(&self) -> u64 {
        match self {
            Self::Max(_) => default_retry_delay_ms(),
            Self::Config(config) => config.delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenSpec {
    #[serde(default)]
    pub equals: Option<EqualsSpec>,
    #[serde(default)]
    pub exists: Option<String>,
    #[serde(default)]
    pub not_exists: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EqualsSpec {
    pub left: Value,
    pub right: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnHandlers {
    #[serde(default)]
    pub success: Option<GotoSpec>,
    #[serde(default)]
    pub failure: Option<GotoSpec>,
    #[serde(default)]
    pub always: Option<GotoSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GotoSpec {
    pub goto: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForEachSpec {
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub items_from: Option<String>,
    #[serde(default, rename = "as")]
    pub alias: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub on_item_complete: Option<OnItemComplete>,
}

impl ForEachSpec {
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or("item")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnItemComplete {
    #[serde(default)]
    pub success: Option<LifecycleAction>,
    #[serde(default)]
    pub failure: Option<LifecycleAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleAction {
    pub move_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub provider_params: Option<Map<String, Value>>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub wait_for: Option<WaitForSpec>,
    #[serde(default)]
    pub for_each: Option<ForEachSpec>,
    #[serde(default)]
    pub input_file: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub output_capture: CaptureMode,
    #[serde(default)]
    pub allow_parse_error: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub depends_on: Option<DependsOn>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retries: Option<RetriesSpec>,
    #[serde(default)]
    pub when: Option<WhenSpec>,
    #[serde(default)]
    pub on: Option<OnHandlers>,
    #[serde(default)]
    pub output_schema: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub output_require: Option<Vec<String>>,
    // Accepted by the parser so validation can report it as deprecated
    // instead of a generic unknown-field error.
    #[serde(default)]
    pub command_override: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind<'a> {
    Provider(&'a str),
    Command(&'a CommandSpec),
    Wait(&'a WaitForSpec),
    ForEach(&'a ForEachSpec),
}

impl Step {
    /// Exactly one of `provider`, `command`, `wait_for`, `for_each` selects
    /// the step kind.
    pub fn kind(&self) -> Result<StepKind<'_>, String> {
        let mut selected = Vec::new();
        if self.provider.is_some() {
            selected.push("provider");
        }
        if self.command.is_some() {
            selected.push("command");
        }
        if self.wait_for.is_some() {
            selected.push("wait_for");
        }
        if self.for_each.is_some() {
            selected.push("for_each");
        }
        match selected.as_slice() {
            [_single] => {}
            [] => {
                return Err(
                    "step requires one of `provider`, `command`, `wait_for`, `for_each`"
                        .to_string(),
                )
            }
            many => {
                return Err(format!(
                    "mutually exclusive step fields: {}",
                    many.join(", ")
                ))
            }
        }
        if let Some(provider) = &self.provider {
            return Ok(StepKind::Provider(provider));
        }
        if let Some(command) = &self.command {
            return Ok(StepKind::Command(command));
        }
        if let Some(wait_for) = &self.wait_for {
            return Ok(StepKind::Wait(wait_for));
        }
        if let Some(for_each) = &self.for_each {
            return Ok(StepKind::ForEach(for_each));
        }
        unreachable!("kind selection is exhaustive")
    }
}

pub const DEFAULT_INBOX_DIR: &str = "inbox";
pub const DEFAULT_PROCESSED_DIR: &str = "processed";
pub const DEFAULT_FAILED_DIR: &str = "failed";
pub const DEFAULT_TASK_EXTENSION: &str = ".task";

/// Immutable after load; the loader hands out the parsed document together
/// with its checksum and never mutates it afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    pub version: WorkflowVersion,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_strict_flow")]
    pub strict_flow: bool,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderTemplate>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub inbox_dir: Option<String>,
    #[serde(default)]
    pub processed_dir: Option<String>,
    #[serde(default)]
    pub failed_dir: Option<String>,
    #[serde(default)]
    pub task_extension: Option<String>,
    pub steps: Vec<Step>,
}

fn default_strict_flow() -> bool {
    true
}

impl Workflow {
    pub fn processed_dir(&self) -> &str {
        self.processed_dir.as_deref().unwrap_or(DEFAULT_PROCESSED_DIR)
    }

    pub fn inbox_dir(&self) -> &str {
        self.inbox_dir.as_deref().unwrap_or(DEFAULT_INBOX_DIR)
    }

    pub fn failed_dir(&self) -> &str {
        self.failed_dir.as_deref().unwrap_or(DEFAULT_FAILED_DIR)
    }

    pub fn task_extension(&self) -> &str {
        self.task_extension.as_deref().unwrap_or(DEFAULT_TASK_EXTENSION)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing_and_ordering() {
        let v111 = WorkflowVersion::parse("1.1.1").expect("parse 1.1.1");
        let v12 = WorkflowVersion::parse("1.2").expect("parse 1.2");
        assert!(v111 < v12);
        assert!(v111.is_supported());
        assert!(!WorkflowVersion::parse("2.0").expect("parse 2.0").is_supported());
        assert!(WorkflowVersion::parse("1.x").is_err());
        assert!(WorkflowVersion::parse("1.1.1.1").is_err());
    }

    #[test]
    fn version_displays_without_zero_patch() {
        assert_eq!(WorkflowVersion::V1_2.to_string(), "1.2");
        assert_eq!(WorkflowVersion::V1_1_1.to_string(), "1.1.1");
    }

    #[test]
    fn inject_shorthand_normalizes_to_list_prepend() {
        let shorthand = InjectSpec::Enabled(true);
        let config = shorthand.config();
        assert_eq!(config.mode, InjectMode::List);
        assert_eq!(config.position, InjectPosition::Prepend);
        assert!(config.instruction.is_none());
    }

    #[test]
    fn step_kind_requires_exactly_one_selection() {
        let raw = "name: Both\ncommand: \"true\"\nwait_for:\n  glob: \"inbox/*\"\n";
        let step: Step = serde_yaml::from_str(raw).expect("parse step");
        assert!(step.kind().is_err());
    }
}
