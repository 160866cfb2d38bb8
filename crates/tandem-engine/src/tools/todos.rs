use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use tandem_core::events::SessionEvent;
use tandem_core::todos::{TodoCounts, TodoItem, TodoProgress};
use tandem_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

#[derive(Deserialize)]
struct TodosParams {
    todos: Vec<TodoItem>,
}

/// Replaces the session's whole Todo list.
pub struct TodosTool;

#[async_trait]
impl Tool for TodosTool {
    fn name(&self) -> &str {
        "todos"
    }

    fn description(&self) -> &str {
        "Replace the session's task checklist. Send the complete list every time; \
         keep exactly one item in_progress while working."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["todos"],
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The updated todo list",
                    "items": {
                        "type": "object",
                        "required": ["content", "status"],
                        "properties": {
                            "content": {
                                "type": "string",
                                "description": "What needs to be done (imperative form)"
                            },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            },
                            "active_form": {
                                "type": "string",
                                "description": "Present continuous form (e.g. 'Running tests')"
                            }
                        }
                    }
                }
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
        let params: TodosParams = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid todos: {e}")))?;

        let counts = TodoCounts::from_items(&params.todos);
        let progress = TodoProgress::from_items(&params.todos);
        ctx.todos.replace(params.todos.clone());
        ctx.events.emit(SessionEvent::TodosUpdated {
            session_id: ctx.session_id.clone(),
            todos: params.todos,
            progress,
        });

        Ok(ToolResult::text(
            format!(
                "Todo list updated successfully.\n\nStatus: {} pending, {} in progress, {} completed\n",
                counts.pending, counts.in_progress, counts.completed
            ),
            start.elapsed(),
        ))
    }
}
