use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;

use tandem_core::context::LlmContext;
use tandem_core::errors::ProviderError;
use tandem_core::messages::{ContentPart, Message, Role};
use tandem_core::provider::{LlmProvider, StreamOptions};

const SUMMARY_PROMPT: &str = "You condense conversation history. Summarize the transcript \
the user provides so the conversation can continue without it. Keep decisions, file paths, \
commands that were run and their outcomes, open tasks, and any background job ids. \
Answer with the summary only.";

/// Produces the condensed text that replaces a run of older messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError>;
}

/// Issues a dedicated, tool-less summarization request to a provider.
pub struct LlmSummarizer {
    provider: Arc<dyn LlmProvider>,
    options: StreamOptions,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            options: StreamOptions {
                max_tokens: Some(4096),
                ..StreamOptions::default()
            },
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let context = LlmContext::new(vec![Message::user_text(transcript(messages))], Vec::new())
            .with_system_prompt(SUMMARY_PROMPT);
        let reply = self.provider.send(&context, &self.options).await?;
        let summary = reply.text().trim().to_string();
        if summary.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "summarization returned no text".into(),
            ));
        }
        Ok(summary)
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "summary",
        Role::ToolResult => "tool result",
    }
}

/// Plain-text rendering of `messages` for the summarization request.
pub fn transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let _ = write!(out, "[{}", role_label(msg.role));
        if msg.is_error {
            out.push_str(", error");
        }
        out.push_str("] ");
        for part in &msg.content {
            match part {
                ContentPart::Text { text } => out.push_str(text),
                ContentPart::Attachment { path, .. } => {
                    let _ = write!(out, "<attachment {path}>");
                }
            }
        }
        for call in &msg.tool_calls {
            let _ = write!(out, "\n  called {}({})", call.name, call.arguments);
        }
        out.push('\n');
    }
    out
}
