use crate::errors::ProviderError;
use crate::ids::ToolCallId;
use crate::messages::{Message, StopReason, ToolCall};

/// Events emitted during LLM streaming. Ordering contract:
///
/// Start → (TextDelta* | ToolCallStart → ToolCallEnd)* → Done
///
/// Error can appear at any point and ends the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    ToolCallStart { tool_call_id: ToolCallId, name: String },
    ToolCallEnd { tool_call: ToolCall },
    Done { message: Message, stop_reason: StopReason },
    Error { error: ProviderError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
