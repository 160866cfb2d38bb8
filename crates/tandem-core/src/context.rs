use crate::messages::Message;
use crate::tools::ToolDefinition;

/// The complete request sent to a provider.
#[derive(Clone, Debug, Default)]
pub struct LlmContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(messages: Vec<Message>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            system_prompt: None,
            messages,
            tools,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::messages::Role::User)
            .map(Message::text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_text_skips_later_roles() {
        let ctx = LlmContext::new(
            vec![
                Message::user_text("first"),
                Message::assistant_text("reply"),
                Message::user_text("second"),
                Message::assistant_text("another"),
            ],
            Vec::new(),
        );
        assert_eq!(ctx.last_user_text().as_deref(), Some("second"));
        assert!(LlmContext::empty().last_user_text().is_none());
    }
}
