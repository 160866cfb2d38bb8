use std::fmt::Write as _;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use tandem_core::tools::{parse_args, Tool, ToolContext, ToolError, ToolResult};

const MAX_LINE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
struct ReadParams {
    file_path: String,
    /// 1-based first line.
    #[serde(default = "first_line")]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn first_line() -> usize {
    1
}

fn default_limit() -> usize {
    2000
}

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file. Lines are numbered from 1."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path"],
            "properties": {
                "file_path": {"type": "string", "description": "Absolute, or relative to the working directory"},
                "offset": {"type": "integer", "minimum": 1, "description": "First line to return"},
                "limit": {"type": "integer", "minimum": 1, "description": "Lines to return"}
            }
        })
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let started = Instant::now();
        let params: ReadParams = parse_args(args)?;
        let path = ctx.resolve(&params.file_path);

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("{}: {e}", path.display())))?;
        let text = String::from_utf8(bytes).map_err(|_| {
            ToolError::ExecutionFailed(format!("{} is not UTF-8 text", path.display()))
        })?;

        Ok(ToolResult::text(
            number_lines(&text, params.offset.max(1), params.limit),
            started.elapsed(),
        ))
    }
}

/// Render `limit` lines starting at `offset` with a right-aligned line
/// number gutter. Overlong lines are clipped and a footer counts the lines
/// left unread.
fn number_lines(text: &str, offset: usize, limit: usize) -> String {
    let total = text.lines().count();
    if total == 0 {
        return "(empty file)".into();
    }
    if offset > total {
        return format!("(offset {offset} is past the last line, {total})");
    }

    let mut out = String::new();
    for (n, line) in text.lines().enumerate().skip(offset - 1).take(limit) {
        let clipped = match line.char_indices().nth(MAX_LINE_CHARS) {
            Some((cut, _)) => &line[..cut],
            None => line,
        };
        let _ = writeln!(out, "{:>6}\t{clipped}", n + 1);
    }

    let shown_to = (offset - 1).saturating_add(limit).min(total);
    if shown_to < total {
        let _ = write!(out, "({} more lines)", total - shown_to);
    }
    out
}
