use tandem_core::messages::{ContentPart, Message};

/// Estimate token count for text content.
/// Approximation: bytes / 4, rounded up.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single message. A caller-supplied
/// `size_estimate` wins over the content-based estimate.
pub fn estimate_message_tokens(msg: &Message) -> usize {
    if let Some(size) = msg.size_estimate {
        return size;
    }
    let mut bytes = 0;
    for part in &msg.content {
        bytes += match part {
            ContentPart::Text { text } => text.len(),
            ContentPart::Attachment { .. } => 0,
        };
    }
    for call in &msg.tool_calls {
        bytes += call.name.len() + call.arguments.to_string().len();
    }
    bytes.div_ceil(4)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
