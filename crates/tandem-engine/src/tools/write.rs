use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use tandem_core::tools::{parse_args, ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

#[derive(Debug, Deserialize)]
struct WriteParams {
    file_path: String,
    content: String,
}

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Replace a file's contents, creating it and any missing parent directories"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path", "content"],
            "properties": {
                "file_path": {"type": "string", "description": "Absolute, or relative to the working directory"},
                "content": {"type": "string"}
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
        let started = Instant::now();
        let params: WriteParams = parse_args(args)?;
        let path = ctx.resolve(&params.file_path);

        let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
        replace_file(&path, params.content.as_bytes())
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("{}: {e}", path.display())))?;

        let verb = if existed { "Updated" } else { "Created" };
        Ok(ToolResult::text(
            format!(
                "{verb} {} ({} bytes, {} lines)",
                path.display(),
                params.content.len(),
                params.content.lines().count()
            ),
            started.elapsed(),
        ))
    }
}

/// Write through a sibling temp file and rename it into place, so a reader
/// never observes a half-written file.
async fn replace_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = staging_path(path);
    if let Err(e) = tokio::fs::write(&staging, content).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }
    tokio::fs::rename(&staging, path).await
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tandem-tmp"))
}
