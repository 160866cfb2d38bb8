//! Runs the tool calls of one assistant message.
//!
//! Concurrent-mode calls are spawned in parallel, sequential-mode calls then
//! run one at a time. Each call is bounded by a timeout and isolated from
//! panics. Results come back in the order the model requested the calls.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, warn};

use tandem_core::events::SessionEvent;
use tandem_core::messages::{Message, ToolCall};
use tandem_core::tools::{ExecutionMode, Tool, ToolContext, ToolDefinition, ToolError};

use crate::registry::ToolRegistry;
use crate::tools::job_tools::{render_snapshot, PAGE_BYTES};
use crate::truncate::{preview, OutputCap};

const PREVIEW_CHARS: usize = 200;

#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    pub tool_timeout: Duration,
    /// Time a new background job gets to produce output before the call returns.
    pub background_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(120),
            background_grace: Duration::from_secs(1),
        }
    }
}

/// A call that ended the tool step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatalToolError {
    pub tool: String,
    pub message: String,
}

/// Results of one batch, one tool-result message per requested call.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<Message>,
    /// First fatal failure in call order.
    pub fatal: Option<FatalToolError>,
    /// Some calls were abandoned because the turn was cancelled.
    pub cancelled: bool,
}

struct CallOutcome {
    message: Message,
    fatal: Option<FatalToolError>,
}

struct Dispatch {
    content: String,
    is_error: bool,
    fatal: bool,
}

impl Dispatch {
    fn ok(content: String, is_error: bool) -> Self {
        Self {
            content,
            is_error,
            fatal: false,
        }
    }

    fn error(content: String) -> Self {
        Self::ok(content, true)
    }

    fn fatal(content: String) -> Self {
        Self {
            content,
            is_error: true,
            fatal: true,
        }
    }
}

enum CallFailure {
    Tool(ToolError),
    Panicked(String),
    TimedOut(Duration),
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, config: ExecutorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Execute every call and return their results in call order.
    ///
    /// The cancellation token is checked before each sequential call; calls
    /// that never ran get an explicit abandoned result so the log holds no
    /// unresolved call.
    pub async fn execute_batch(&self, calls: &[ToolCall], ctx: &ToolContext) -> BatchOutcome {
        let mut slots: Vec<Option<CallOutcome>> = calls.iter().map(|_| None).collect();

        let (concurrent, sequential): (Vec<usize>, Vec<usize>) =
            (0..calls.len()).partition(|&i| {
                self.registry
                    .get(&calls[i].name)
                    .is_some_and(|t| t.execution_mode() == ExecutionMode::Concurrent)
            });

        let handles: Vec<_> = concurrent
            .iter()
            .map(|&i| {
                let registry = Arc::clone(&self.registry);
                let config = self.config;
                let call = calls[i].clone();
                let ctx = ctx.clone();
                (
                    i,
                    tokio::spawn(async move { run_call(&registry, config, &call, &ctx).await }),
                )
            })
            .collect();

        for (i, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(tool = %calls[i].name, error = %join_err, "tool task failed");
                    abandoned(&calls[i], "Tool execution failed")
                }
            };
            slots[i] = Some(outcome);
        }

        let mut fatal_seen = slots.iter().flatten().any(|o| o.fatal.is_some());
        let mut cancelled = false;
        for &i in &sequential {
            let call = &calls[i];
            let outcome = if fatal_seen {
                abandoned(call, "skipped after a fatal tool error")
            } else if ctx.cancel.is_cancelled() {
                cancelled = true;
                abandoned(call, "turn was cancelled")
            } else {
                run_call(&self.registry, self.config, call, ctx).await
            };
            fatal_seen |= outcome.fatal.is_some();
            slots[i] = Some(outcome);
        }

        let mut results = Vec::with_capacity(calls.len());
        let mut fatal = None;
        for (slot, call) in slots.into_iter().zip(calls) {
            let outcome = slot.unwrap_or_else(|| abandoned(call, "tool call was not dispatched"));
            if fatal.is_none() {
                fatal = outcome.fatal;
            }
            results.push(outcome.message);
        }

        BatchOutcome {
            results,
            fatal,
            cancelled,
        }
    }
}

/// Tool-result message resolving a call that was never run.
pub fn abandoned_result(call: &ToolCall, reason: &str) -> Message {
    Message::tool_result(
        call.id.clone(),
        format!("[error] Tool call abandoned: {reason}"),
        true,
    )
}

fn abandoned(call: &ToolCall, reason: &str) -> CallOutcome {
    CallOutcome {
        message: abandoned_result(call, reason),
        fatal: None,
    }
}

async fn run_call(
    registry: &ToolRegistry,
    config: ExecutorConfig,
    call: &ToolCall,
    ctx: &ToolContext,
) -> CallOutcome {
    ctx.events.emit(SessionEvent::ToolCallStarted {
        session_id: ctx.session_id.clone(),
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
    });

    let start = Instant::now();
    let outcome = dispatch(registry, config, call, ctx).await;
    let duration = start.elapsed();

    let content = OutputCap::for_tool(&call.name)
        .apply(&outcome.content)
        .into_owned();
    debug!(
        tool = %call.name,
        is_error = outcome.is_error,
        duration_ms = duration.as_millis() as u64,
        "tool call finished"
    );
    ctx.events.emit(SessionEvent::ToolCallFinished {
        session_id: ctx.session_id.clone(),
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        is_error: outcome.is_error,
        result_preview: preview(&content, PREVIEW_CHARS),
        duration_ms: duration.as_millis() as u64,
    });

    let fatal = outcome.fatal.then(|| FatalToolError {
        tool: call.name.clone(),
        message: content.clone(),
    });
    let text = if outcome.is_error {
        format!("[error] {content}")
    } else {
        content
    };
    CallOutcome {
        message: Message::tool_result(call.id.clone(), text, outcome.is_error),
        fatal,
    }
}

async fn dispatch(
    registry: &ToolRegistry,
    config: ExecutorConfig,
    call: &ToolCall,
    ctx: &ToolContext,
) -> Dispatch {
    if !call.arguments.is_object() {
        warn!(tool = %call.name, "tool arguments are not a JSON object");
        return Dispatch::fatal(format!(
            "arguments for {} must be a JSON object, got {}",
            call.name, call.arguments
        ));
    }

    let Some(tool) = registry.get(&call.name) else {
        return Dispatch::error(format!("Unknown tool: {}", call.name));
    };

    if tool.supports_background() && call.arguments["background"].as_bool() == Some(true) {
        return start_background(tool.as_ref(), config, call, ctx).await;
    }

    match guarded(config.tool_timeout, tool.invoke(call.arguments.clone(), ctx)).await {
        Ok(result) => Dispatch::ok(result.content, result.is_error),
        Err(failure) => failed(call, failure),
    }
}

async fn start_background(
    tool: &dyn Tool,
    config: ExecutorConfig,
    call: &ToolCall,
    ctx: &ToolContext,
) -> Dispatch {
    let job_id = match guarded(
        config.tool_timeout,
        tool.invoke_background(call.arguments.clone(), ctx),
    )
    .await
    {
        Ok(id) => id,
        Err(failure) => return failed(call, failure),
    };

    let Some(job) = ctx.jobs.get(&job_id) else {
        error!(tool = %call.name, job_id = %job_id, "background job missing from registry");
        return Dispatch::error(format!("Background job {job_id} was not registered"));
    };

    debug!(tool = %call.name, job_id = %job_id, "background job started");
    ctx.events.emit(SessionEvent::BackgroundJobStarted {
        session_id: ctx.session_id.clone(),
        job_id: job_id.clone(),
        command: job.command().to_string(),
    });

    tokio::select! {
        _ = job.wait_finished(config.background_grace) => {}
        () = ctx.cancel.cancelled() => {}
    }

    Dispatch::ok(
        format!(
            "Background job {job_id} started. Use job_output to read more and job_kill to stop it.\n{}",
            render_snapshot(&job.page(0, PAGE_BYTES))
        ),
        false,
    )
}

/// Await a tool future under a timeout, converting panics into failures.
async fn guarded<T, F>(timeout: Duration, fut: F) -> Result<T, CallFailure>
where
    F: Future<Output = Result<T, ToolError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(CallFailure::Tool(e)),
        Ok(Err(panic)) => Err(CallFailure::Panicked(panic_message(&panic))),
        Err(_) => Err(CallFailure::TimedOut(timeout)),
    }
}

fn failed(call: &ToolCall, failure: CallFailure) -> Dispatch {
    match failure {
        CallFailure::Tool(e) if e.is_fatal() => {
            warn!(tool = %call.name, error = %e, "tool failed fatally");
            Dispatch::fatal(e.to_string())
        }
        CallFailure::Tool(e) => Dispatch::error(e.to_string()),
        CallFailure::Panicked(msg) => {
            error!(tool = %call.name, panic = %msg, "tool panicked during execution");
            Dispatch::error("Internal error: tool crashed".into())
        }
        CallFailure::TimedOut(timeout) => {
            warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
            Dispatch::error(format!("Tool timed out after {timeout:?}"))
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
