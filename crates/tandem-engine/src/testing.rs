//! Scripted tools and stores shared by the engine's unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use tandem_core::ids::{JobId, SessionId};
use tandem_core::jobs::{BackgroundJob, JobStatus};
use tandem_core::messages::{Message, Role};
use tandem_core::session::Session;
use tandem_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};
use tandem_store::{MemorySessionStore, SessionStore, SessionSummary, StoreError};

use crate::registry::ToolRegistry;

pub fn registry_with(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    registry
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Sleeps, then answers `"<name> done: <tag>"`.
pub struct SleepTool {
    name: String,
    delay: Duration,
    mode: ExecutionMode,
}

impl SleepTool {
    pub fn concurrent(name: &str, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            mode: ExecutionMode::Concurrent,
        }
    }

    pub fn sequential(name: &str, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            mode: ExecutionMode::Sequential,
        }
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "sleeps"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        empty_schema()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode.clone()
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        tokio::time::sleep(self.delay).await;
        let tag = args["tag"].as_str().unwrap_or_default();
        Ok(ToolResult::text(
            format!("{} done: {tag}", self.name),
            self.delay,
        ))
    }
}

pub struct FailTool {
    name: String,
    fatal: bool,
}

impl FailTool {
    pub fn recoverable(name: &str) -> Self {
        Self {
            name: name.into(),
            fatal: false,
        }
    }

    pub fn fatal(name: &str) -> Self {
        Self {
            name: name.into(),
            fatal: true,
        }
    }
}

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        empty_schema()
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn invoke(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        if self.fatal {
            Err(ToolError::Fatal("disk unavailable".into()))
        } else {
            Err(ToolError::ExecutionFailed("boom".into()))
        }
    }
}

pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic"
    }

    fn description(&self) -> &str {
        "panics"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        empty_schema()
    }

    async fn invoke(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        panic!("tool exploded");
    }
}

/// Fake detached job: prints `started`, then `finished` after `ms`
/// milliseconds unless killed first.
pub struct BackgroundTool;

#[async_trait]
impl Tool for BackgroundTool {
    fn name(&self) -> &str {
        "background"
    }

    fn description(&self) -> &str {
        "runs a fake job"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        empty_schema()
    }

    fn supports_background(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::text("ran in foreground", Duration::ZERO))
    }

    async fn invoke_background(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<JobId, ToolError> {
        let ms = args["ms"].as_u64().unwrap_or(10);
        let job = ctx
            .jobs
            .register(BackgroundJob::new(ctx.session_id.clone(), "fake-job"));
        job.output().append("started\n");

        let id = job.id().clone();
        let kill = job.kill_signal();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(ms)) => {
                    job.output().append("finished\n");
                    job.finish(JobStatus::Exited { code: Some(0) });
                }
                () = kill.cancelled() => {
                    job.finish(JobStatus::Killed);
                }
            }
        });
        Ok(id)
    }
}

/// Blocks until released or until the turn is cancelled.
pub struct GateTool {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GateTool {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Tool for GateTool {
    fn name(&self) -> &str {
        "gate"
    }

    fn description(&self) -> &str {
        "waits for a release"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        empty_schema()
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn invoke(
        &self,
        _args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        self.started.notify_one();
        tokio::select! {
            () = self.release.notified() => Ok(ToolResult::text("released", start.elapsed())),
            () = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
        }
    }
}

/// Records the highest number of simultaneous invocations.
pub struct OverlapTool {
    active: AtomicUsize,
    pub peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl OverlapTool {
    pub fn new(delay: Duration) -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }
}

#[async_trait]
impl Tool for OverlapTool {
    fn name(&self) -> &str {
        "overlap"
    }

    fn description(&self) -> &str {
        "counts overlapping calls"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        empty_schema()
    }

    async fn invoke(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolResult::text("overlapped", self.delay))
    }
}

/// Memory store whose saves fail, either always or from the n-th save on.
#[derive(Default)]
pub struct FailingStore {
    inner: MemorySessionStore,
    pub fail_saves: AtomicBool,
    /// 1-based save number from which saves fail; 0 disables.
    fail_from: AtomicUsize,
    saves: AtomicUsize,
}

impl FailingStore {
    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_saves.store(true, Ordering::SeqCst);
        store
    }

    pub fn failing_from(nth: usize) -> Self {
        let store = Self::default();
        store.fail_from.store(nth, Ordering::SeqCst);
        store
    }
}

#[async_trait]
impl SessionStore for FailingStore {
    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.inner.load_session(id).await
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let nth = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        let from = self.fail_from.load(Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) || (from > 0 && nth >= from) {
            return Err(StoreError::Database("disk full".into()));
        }
        self.inner.save_session(session).await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.inner.delete_session(id).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.inner.list_sessions().await
    }
}

/// Every tool call in the log has a result after it.
pub fn assert_calls_resolved(messages: &[Message]) {
    let mut pending = HashSet::new();
    for message in messages {
        for call in &message.tool_calls {
            pending.insert(call.id.clone());
        }
        if message.role == Role::ToolResult {
            if let Some(id) = &message.tool_call_id {
                assert!(pending.remove(id), "result without a preceding call: {id}");
            }
        }
    }
    assert!(pending.is_empty(), "unresolved tool calls: {pending:?}");
}
