pub mod bash;
pub mod job_tools;
pub mod read;
pub mod todos;
pub mod vcs_status;
pub mod write;

use std::sync::Arc;
use std::time::Duration;

use crate::registry::ToolRegistry;

/// Registry with every built-in tool. `bash_timeout` is the default
/// foreground shell timeout.
pub fn create_default_registry(bash_timeout: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // Files
    registry.register(Arc::new(read::ReadTool));
    registry.register(Arc::new(write::WriteTool));

    // Shell and background jobs
    registry.register(Arc::new(bash::BashTool::with_timeout(bash_timeout)));
    registry.register(Arc::new(job_tools::JobOutputTool));
    registry.register(Arc::new(job_tools::JobKillTool));

    // Session
    registry.register(Arc::new(todos::TodosTool));
    registry.register(Arc::new(vcs_status::VcsStatusTool));

    registry
}
