use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;
use crate::ids::{JobId, SessionId};
use crate::jobs::{JobError, JobRegistry};
use crate::todos::SharedTodos;

/// Tools declare whether they can run in parallel with others.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Safe to run in parallel (read, job queries).
    Concurrent,
    /// Must run alone (shell, file writes, todo updates).
    Sequential,
}

/// Context available to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub working_directory: PathBuf,
    /// Cancelled when the owning turn is cancelled; long-running tools poll it.
    pub cancel: CancellationToken,
    pub jobs: JobRegistry,
    pub todos: SharedTodos,
    pub events: EventSink,
}

impl ToolContext {
    pub fn new(session_id: SessionId, working_directory: PathBuf) -> Self {
        Self {
            session_id,
            working_directory,
            cancel: CancellationToken::new(),
            jobs: JobRegistry::new(),
            todos: SharedTodos::default(),
            events: EventSink::default(),
        }
    }

    /// Absolute paths pass through; relative ones hang off the working directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_directory.join(path)
        }
    }
}

/// Decode the model-supplied arguments into a tool's typed parameters.
pub fn parse_args<T: DeserializeOwned>(args: serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Result returned by a tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolResult {
    pub fn text(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            duration,
        }
    }
}

/// Tool definition sent to the LLM as part of the context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    /// Whether [`Tool::invoke_background`] is implemented.
    fn supports_background(&self) -> bool {
        false
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;

    /// Start the work detached from the turn and register it in `ctx.jobs`.
    async fn invoke_background(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<JobId, ToolError> {
        Err(ToolError::Unsupported(format!(
            "{} cannot run in the background",
            self.name()
        )))
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ToolError {
    /// Fatal errors end the turn; every other error is fed back to the model.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<JobError> for ToolError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::UnknownJob(id) => Self::UnknownJob(id),
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
