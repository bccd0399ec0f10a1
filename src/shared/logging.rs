use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err("log level must be one of: debug, info, warn, error".to_string()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run-scoped logger. Every record lands in `<run_root>/logs/orchestrator.log`
/// as one JSON line; records at or above the threshold are mirrored to stderr
/// unless quiet.
#[derive(Debug, Clone)]
pub struct RunLogger {
    log_path: PathBuf,
    threshold: LogLevel,
    mirror_stderr: bool,
}

impl RunLogger {
    pub fn new(logs_dir: &Path, threshold: LogLevel, mirror_stderr: bool) -> Self {
        Self {
            log_path: logs_dir.join("orchestrator.log"),
            threshold,
            mirror_stderr,
        }
    }

    pub fn log(&self, level: LogLevel, event: &str, message: &str) {
        if level < self.threshold {
            return;
        }
        let payload = serde_json::json!({
            "timestamp": super::ids::now_utc_rfc3339(),
            "level": level.as_str(),
            "event": event,
            "message": message,
        });
        let Ok(line) = serde_json::to_string(&payload) else {
            return;
        };
        if let Some(parent) = self.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| file.write_all(format!("{line}\n").as_bytes()));
        if self.mirror_stderr {
            eprintln!("[{}] {event}: {message}", level.as_str());
        }
    }

    pub fn debug(&self, event: &str, message: &str) {
        self.log(LogLevel::Debug, event, message);
    }

    pub fn info(&self, event: &str, message: &str) {
        self.log(LogLevel::Info, event, message);
    }

    pub fn warn(&self, event: &str, message: &str) {
        self.log(LogLevel::Warn, event, message);
    }

    pub fn error(&self, event: &str, message: &str) {
        self.log(LogLevel::Error, event, message);
    }
}
