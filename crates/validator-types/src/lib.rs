//! Shared types, errors, context, and results for the mass validation engine.
//!
//! This crate provides the foundational types used across all other validator crates:
//! - `ValidatorError`: unified error taxonomy
//! - `Context`: thread-safe key-value store a context plugin exposes to later stages
//! - `StepOutcome` / `CheckResult` / `RunResult`: results of plugin calls and whole runs
//! - `JobState` / `ExecutorKind`: mass job bookkeeping

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The plugin lifecycle call that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Select,
    Check,
    Fix,
    Teardown,
    Result,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Select => "select",
            Stage::Check => "check",
            Stage::Fix => "fix",
            Stage::Teardown => "teardown",
            Stage::Result => "result",
        };
        f.write_str(s)
    }
}

/// Unified error type for all validator subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    // === Configuration Errors ===
    #[error("Plugin '{name}' is not registered (at '{path}')")]
    UnregisteredPlugin { name: String, path: String },

    #[error("Plugin '{name}' is already registered with a different constructor")]
    DuplicatePlugin { name: String },

    // === Schema Errors ===
    #[error("Validation failed at '{path}': {message}")]
    Validation { path: String, message: String },

    #[error("Template cooking failed for '{plugin}': {source}")]
    TemplateCook {
        plugin: String,
        #[source]
        source: Box<ValidatorError>,
    },

    // === Execution Errors ===
    #[error("Plugin '{plugin}' failed during {stage}: {message}")]
    PluginRuntime {
        plugin: String,
        stage: Stage,
        message: String,
    },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Run manager was already used; create a new one per run")]
    AlreadyRan,

    #[error("Executor error: {0}")]
    Executor(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ValidatorError {
    /// Shorthand for a schema validation error at `path`.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidatorError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an error raised from inside a plugin call.
    pub fn runtime(plugin: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        ValidatorError::PluginRuntime {
            plugin: plugin.into(),
            stage,
            message: message.into(),
        }
    }

    /// Returns `true` for errors the caller can fix by correcting the input schema.
    ///
    /// These are raised before any job exists, so nothing has been executed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ValidatorError::UnregisteredPlugin { .. }
                | ValidatorError::DuplicatePlugin { .. }
                | ValidatorError::Validation { .. }
                | ValidatorError::TemplateCook { .. }
        )
    }

    /// Path of the offending schema field, when the error has one.
    pub fn field_path(&self) -> Option<&str> {
        match self {
            ValidatorError::UnregisteredPlugin { path, .. }
            | ValidatorError::Validation { path, .. } => Some(path),
            ValidatorError::TemplateCook { source, .. } => source.field_path(),
            _ => None,
        }
    }

    /// Maps the error to an HTTP status code for service mode.
    pub fn http_status(&self) -> u16 {
        if self.is_validation() {
            422
        } else {
            500
        }
    }
}

/// A convenience alias for `Result<T, ValidatorError>`.
pub type Result<T> = std::result::Result<T, ValidatorError>;

// ---------------------------------------------------------------------------
// Context: thread-safe key-value store for one run's environment
// ---------------------------------------------------------------------------

/// Thread-safe key-value store shared between the plugins of one run.
///
/// Cloning a `Context` yields another handle to the **same** inner state.
/// Use [`clone_isolated`](Context::clone_isolated) to get a deep copy for
/// a check's sub-context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, Default)]
struct ContextInner {
    values: HashMap<String, serde_json::Value>,
    logs: Vec<String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner::default())),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Remove a key, returning its previous value.
    pub async fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.write().await.values.remove(key)
    }

    /// Convenience accessor for a JSON array of strings. Non-string entries are skipped;
    /// a missing key yields an empty list.
    pub async fn get_strings(&self, key: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Append a free-form log entry.
    pub async fn append_log(&self, entry: impl Into<String>) {
        self.inner.write().await.logs.push(entry.into());
    }

    /// All log entries recorded so far.
    pub async fn logs(&self) -> Vec<String> {
        self.inner.read().await.logs.clone()
    }

    /// Deep copy that is fully independent of the original context.
    pub async fn clone_isolated(&self) -> Context {
        let guard = self.inner.read().await;
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StepOutcome: result of one plugin lifecycle call
// ---------------------------------------------------------------------------

/// A normal, reported outcome of a plugin call. Unexpected failures are
/// `Err(ValidatorError)` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub passed: bool,
    pub message: String,
}

impl StepOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckResult / RunResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

/// Outcome of one concrete pipeline execution. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub per_check: Vec<CheckResult>,
}

impl RunResult {
    /// Aggregate check results: the run passes only if every check passed.
    pub fn from_checks(per_check: Vec<CheckResult>) -> Self {
        let failed = per_check.iter().filter(|c| !c.passed).count();
        let passed = failed == 0;
        let message = if passed {
            "Check done".to_string()
        } else {
            format!("{} of {} checks failed", failed, per_check.len())
        };
        Self {
            passed,
            message,
            per_check,
        }
    }

    /// A failed run with no per-check detail (setup error, crash, timeout).
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            per_check: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mass job bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

/// How a mass job is executed. The numeric values match the CLI selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    InProcess = 0,
    Process = 1,
}

impl TryFrom<u8> for ExecutorKind {
    type Error = ValidatorError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ExecutorKind::InProcess),
            1 => Ok(ExecutorKind::Process),
            other => Err(ValidatorError::validation(
                "executor",
                format!("unknown executor {} (expected 0 or 1)", other),
            )),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::InProcess => f.write_str("in_process"),
            ExecutorKind::Process => f.write_str("process"),
        }
    }
}
