use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tandem_core::ids::JobId;
use tandem_core::jobs::{BackgroundJob, JobStatus, OutputBuffer};
use tandem_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TIMEOUT_MS: u64 = 600_000;
/// How long a finished job's pipe readers may take to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BashTool {
    timeout: Duration,
}

impl BashTool {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

fn command_arg(args: &serde_json::Value) -> Result<&str, ToolError> {
    args["command"]
        .as_str()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments("command is required".into()))
}

fn shell(command: &str, ctx: &ToolContext) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&ctx.working_directory)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command. Set background to true for long-running commands; \
         poll them with job_output and stop them with job_kill."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (max 600000, foreground only)"
                },
                "background": {
                    "type": "boolean",
                    "description": "Run detached and return a job id immediately"
                }
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    fn supports_background(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let command = command_arg(&args)?;

        let timeout = args["timeout"]
            .as_u64()
            .map(|ms| Duration::from_millis(ms.min(MAX_TIMEOUT_MS)))
            .unwrap_or(self.timeout);

        let mut cmd = shell(command, ctx);
        // The child is killed when this future is dropped on cancel or timeout.
        let output = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            res = tokio::time::timeout(timeout, cmd.output()) => res
                .map_err(|_| ToolError::Timeout(timeout))?
                .map_err(|e| ToolError::ExecutionFailed(format!("Failed to execute command: {e}")))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut content = stdout.to_string();
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("STDERR:\n");
            content.push_str(&stderr);
        }
        if content.is_empty() {
            content = "(no output)".to_string();
        }

        let is_error = !output.status.success();
        if is_error {
            let exit_code = output.status.code().unwrap_or(-1);
            content = format!("Exit code: {exit_code}\n{content}");
        }

        Ok(ToolResult {
            content,
            is_error,
            duration: start.elapsed(),
        })
    }

    async fn invoke_background(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<JobId, ToolError> {
        let command = command_arg(&args)?;

        let mut child = shell(command, ctx)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to start command: {e}")))?;

        let job = ctx
            .jobs
            .register(BackgroundJob::new(ctx.session_id.clone(), command));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, job.output().clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, job.output().clone())));
        }

        let job_id = job.id().clone();
        tokio::spawn(drive_job(job, child, readers));
        Ok(job_id)
    }
}

/// Copy a pipe into the job's buffer line by line until EOF.
async fn pump<R: AsyncRead + Unpin>(reader: R, buffer: OutputBuffer) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => buffer.append(&String::from_utf8_lossy(&line)),
            Err(e) => {
                debug!(error = %e, "background pipe read failed");
                break;
            }
        }
    }
}

/// Wait for the process to exit or for a kill request, then record the
/// terminal status once the output has been drained.
async fn drive_job(job: Arc<BackgroundJob>, mut child: Child, readers: Vec<JoinHandle<()>>) {
    let kill = job.kill_signal();
    let exited = tokio::select! {
        res = child.wait() => Some(res),
        () = kill.cancelled() => None,
    };

    let status = match exited {
        Some(Ok(status)) => JobStatus::Exited {
            code: status.code(),
        },
        Some(Err(e)) => JobStatus::Failed {
            message: e.to_string(),
        },
        None => {
            if let Err(e) = child.kill().await {
                warn!(job_id = %job.id(), error = %e, "failed to kill background process");
            }
            JobStatus::Killed
        }
    };

    for reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(job_id = %job.id(), "output reader still open after exit");
        }
    }

    debug!(job_id = %job.id(), ?status, "background job finished");
    job.finish(status);
}
