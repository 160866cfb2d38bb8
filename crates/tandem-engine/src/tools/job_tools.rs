//! Tools that reach background jobs through the shared job registry. Any
//! session's turn may query or kill any job by id.

use std::time::Instant;

use async_trait::async_trait;

use tandem_core::ids::JobId;
use tandem_core::jobs::{JobSnapshot, JobStatus};
use tandem_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

use crate::truncate::OutputCap;

/// Output bytes per `job_output` reply; leaves room under the tool output
/// cap for the header so a page is never truncated.
pub const PAGE_BYTES: usize = OutputCap::DEFAULT.0 - 4 * 1024;

fn job_id_arg(args: &serde_json::Value) -> Result<JobId, ToolError> {
    args["job_id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(JobId::from_raw)
        .ok_or_else(|| ToolError::InvalidArguments("job_id is required".into()))
}

fn status_line(status: &JobStatus) -> String {
    match status {
        JobStatus::Running => "running".to_string(),
        JobStatus::Exited { code: Some(code) } => format!("exited with code {code}"),
        JobStatus::Exited { code: None } => "exited".to_string(),
        JobStatus::Killed => "killed".to_string(),
        JobStatus::Failed { message } => format!("failed: {message}"),
    }
}

/// Text form of a job snapshot shared by the job tools and the executor's
/// background reply.
pub fn render_snapshot(snap: &JobSnapshot) -> String {
    let mut out = format!(
        "Job {} ({})\nstatus: {}\nfinished: {}\nnext_offset: {}\n",
        snap.job_id,
        snap.command,
        status_line(&snap.status),
        snap.finished,
        snap.next_offset
    );
    let unread = snap.output_len.saturating_sub(snap.next_offset);
    if unread > 0 {
        out.push_str(&format!("unread: {unread} bytes (read again from next_offset)\n"));
    }
    if snap.output.is_empty() {
        out.push_str("(no new output)");
    } else {
        out.push_str("--- output ---\n");
        out.push_str(&snap.output);
    }
    out
}

pub struct JobOutputTool;

#[async_trait]
impl Tool for JobOutputTool {
    fn name(&self) -> &str {
        "job_output"
    }

    fn description(&self) -> &str {
        "Read the buffered output of a background job without waiting for it to finish"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["job_id"],
            "properties": {
                "job_id": {"type": "string"},
                "offset": {
                    "type": "integer",
                    "description": "Byte offset to read from (next_offset of a previous read)"
                }
            }
        })
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let job_id = job_id_arg(&args)?;
        let offset = args["offset"].as_u64().unwrap_or(0) as usize;
        let snap = ctx.jobs.output_page(&job_id, offset, PAGE_BYTES)?;
        Ok(ToolResult::text(render_snapshot(&snap), start.elapsed()))
    }
}

pub struct JobKillTool;

#[async_trait]
impl Tool for JobKillTool {
    fn name(&self) -> &str {
        "job_kill"
    }

    fn description(&self) -> &str {
        "Terminate a background job. Killing a job that already exited is a no-op."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["job_id"],
            "properties": {
                "job_id": {"type": "string"}
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let job_id = job_id_arg(&args)?;
        let snap = ctx.jobs.kill(&job_id).await?;
        Ok(ToolResult::text(
            format!("Job {} is {}", snap.job_id, status_line(&snap.status)),
            start.elapsed(),
        ))
    }
}
