use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::context::LlmContext;
use crate::errors::ProviderError;
use crate::messages::Message;
use crate::stream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Options controlling generation.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
}

/// An LLM backend. Implementations must keep rate-limit and permanent
/// failures distinguishable through [`ProviderError`].
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn context_window(&self) -> usize;

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, ProviderError>;

    /// Non-streaming request: drives `stream` to completion and returns the
    /// final assistant message.
    async fn send(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<Message, ProviderError> {
        let mut stream = self.stream(context, options).await?;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Done { message, .. } => return Ok(message),
                StreamEvent::Error { error } => return Err(error),
                _ => {}
            }
        }
        Err(ProviderError::StreamInterrupted(
            "stream ended without a final message".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StopReason;

    struct FixedProvider {
        events: Vec<StreamEvent>,
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn model(&self) -> &str {
            "fixed-model"
        }

        fn context_window(&self) -> usize {
            1_000
        }

        async fn stream(
            &self,
            _context: &LlmContext,
            _options: &StreamOptions,
        ) -> Result<EventStream, ProviderError> {
            Ok(Box::pin(futures::stream::iter(self.events.clone())))
        }
    }

    #[tokio::test]
    async fn send_returns_done_message() {
        let provider = FixedProvider {
            events: vec![
                StreamEvent::Start,
                StreamEvent::TextDelta { delta: "hi".into() },
                StreamEvent::Done {
                    message: Message::assistant_text("hi"),
                    stop_reason: StopReason::EndTurn,
                },
            ],
        };
        let msg = provider
            .send(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(msg.text(), "hi");
    }

    #[tokio::test]
    async fn send_surfaces_stream_error() {
        let provider = FixedProvider {
            events: vec![
                StreamEvent::Start,
                StreamEvent::Error {
                    error: ProviderError::RateLimited { retry_after: None },
                },
            ],
        };
        let err = provider
            .send(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn send_without_done_is_interrupted() {
        let provider = FixedProvider {
            events: vec![StreamEvent::Start],
        };
        let err = provider
            .send(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }
}
