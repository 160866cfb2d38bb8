use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::json;

use tandem_core::context::LlmContext;
use tandem_core::errors::ProviderError;
use tandem_core::messages::{Message, Role, StopReason, ToolCall};
use tandem_core::provider::{EventStream, LlmProvider, StreamOptions};
use tandem_core::stream::StreamEvent;

const PREVIEW_CHARS: usize = 200;

/// Offline provider used by the binary.
///
/// Replies `echo: <text>` to plain input. Input starting with `!` becomes a
/// `bash` tool call (a trailing `&` requests background mode), and a tool
/// result is answered with a short acknowledgement so the turn ends.
#[derive(Clone, Debug, Default)]
pub struct EchoProvider {
    latency: Option<Duration>,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response, useful for exercising queueing and cancel.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn respond(context: &LlmContext) -> Vec<StreamEvent> {
        if let Some(last) = context.messages.last() {
            if last.role == Role::ToolResult {
                let status = if last.is_error { "failed" } else { "finished" };
                let text = format!("tool {status}: {}", preview(&last.text()));
                return text_events(text);
            }
        }

        let input = context.last_user_text().unwrap_or_default();
        let trimmed = input.trim();

        if let Some(command) = trimmed.strip_prefix('!') {
            let command = command.trim();
            let (command, background) = match command.strip_suffix('&') {
                Some(rest) => (rest.trim_end(), true),
                None => (command, false),
            };
            let mut args = json!({ "command": command });
            if background {
                args["background"] = json!(true);
            }
            return tool_call_events(ToolCall::new("bash", args));
        }

        text_events(format!("echo: {}", preview(trimmed)))
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    out.push('…');
    out
}

fn text_events(text: String) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Start];
    for word in text.split_inclusive(' ') {
        events.push(StreamEvent::TextDelta {
            delta: word.to_string(),
        });
    }
    events.push(StreamEvent::Done {
        message: Message::assistant_text(text),
        stop_reason: StopReason::EndTurn,
    });
    events
}

fn tool_call_events(call: ToolCall) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start,
        StreamEvent::ToolCallStart {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
        },
        StreamEvent::ToolCallEnd {
            tool_call: call.clone(),
        },
        StreamEvent::Done {
            message: Message::assistant_tool_calls("", vec![call]),
            stop_reason: StopReason::ToolUse,
        },
    ]
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn model(&self) -> &str {
        "echo-1"
    }

    fn context_window(&self) -> usize {
        32_000
    }

    async fn stream(
        &self,
        context: &LlmContext,
        _options: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(Box::pin(stream::iter(Self::respond(context))))
    }
}
