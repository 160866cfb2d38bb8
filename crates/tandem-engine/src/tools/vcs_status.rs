use std::time::Instant;

use async_trait::async_trait;

use tandem_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use crate::vcs;

/// Reports the version control state of the working directory.
pub struct VcsStatusTool;

#[async_trait]
impl Tool for VcsStatusTool {
    fn name(&self) -> &str {
        "vcs_status"
    }

    fn description(&self) -> &str {
        "Show the Git or Jujutsu status of the working directory"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn invoke(
        &self,
        _args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let content = match vcs::detect(&ctx.working_directory).await {
            Some(info) => {
                let body = serde_json::to_string_pretty(&info)
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                format!("{}\n{body}", info.indicator())
            }
            None => "No version control repository found".to_string(),
        };
        Ok(ToolResult::text(content, start.elapsed()))
    }
}
