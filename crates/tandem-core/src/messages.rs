use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, ToolCallId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    ToolResult,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "attachment")]
    Attachment { path: String, mime_type: String },
}

/// A structured request from the model to invoke a named tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Ids of the messages a summary replaced, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary_of: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.summary_of.is_empty() && self.stop_reason.is_none()
    }
}

/// One entry of a session log. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Caller-supplied size; when absent the size is estimated from content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<usize>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            size_estimate: None,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn user(content: Vec<ContentPart>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, vec![ContentPart::Text { text: text.into() }]);
        msg.metadata.stop_reason = Some(StopReason::EndTurn);
        msg
    }

    pub fn assistant_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::Text { text }]
        };
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg.metadata.stop_reason = Some(StopReason::ToolUse);
        msg
    }

    pub fn tool_result(tool_call_id: ToolCallId, text: impl Into<String>, is_error: bool) -> Self {
        let mut msg = Self::with_role(Role::ToolResult, vec![ContentPart::Text { text: text.into() }]);
        msg.tool_call_id = Some(tool_call_id);
        msg.is_error = is_error;
        msg
    }

    /// A system message standing in for `replaced` earlier messages.
    pub fn summary(text: impl Into<String>, replaced: Vec<MessageId>) -> Self {
        let mut msg = Self::with_role(Role::System, vec![ContentPart::Text { text: text.into() }]);
        msg.metadata.summary_of = replaced;
        msg
    }

    pub fn with_size_estimate(mut self, size: usize) -> Self {
        self.size_estimate = Some(size);
        self
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Attachment { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_summary(&self) -> bool {
        !self.metadata.summary_of.is_empty()
    }
}
