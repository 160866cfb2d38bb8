//! Scripted provider for tests. Each `stream` call consumes the next
//! [`MockResponse`]; running out of script is an `InvalidRequest` error so a
//! test that loops one round trip too many fails loudly.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tandem_core::context::LlmContext;
use tandem_core::errors::ProviderError;
use tandem_core::messages::{Message, StopReason, ToolCall};
use tandem_core::provider::{EventStream, LlmProvider, StreamOptions};
use tandem_core::stream::StreamEvent;

pub enum MockResponse {
    Stream(Vec<StreamEvent>),
    /// Fail the `stream` call itself, before any event.
    Error(ProviderError),
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Assistant text, delivered in chunks, ending the turn.
    pub fn text_chunks(chunks: &[&str]) -> Self {
        let text: String = chunks.concat();
        let deltas = chunks.iter().map(|c| StreamEvent::TextDelta {
            delta: (*c).to_string(),
        });
        Self::Stream(framed(
            deltas,
            Message::assistant_text(text),
            StopReason::EndTurn,
        ))
    }

    pub fn stream_text(text: &str) -> Self {
        Self::text_chunks(&[text])
    }

    /// Assistant message requesting `calls`.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        let announced = calls.iter().flat_map(|call| {
            [
                StreamEvent::ToolCallStart {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                },
                StreamEvent::ToolCallEnd {
                    tool_call: call.clone(),
                },
            ]
        });
        let events: Vec<StreamEvent> = announced.collect();
        Self::Stream(framed(
            events,
            Message::assistant_tool_calls("", calls),
            StopReason::ToolUse,
        ))
    }

    /// Stream opens, then fails mid-response.
    pub fn stream_error(error: ProviderError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn framed(
    body: impl IntoIterator<Item = StreamEvent>,
    message: Message,
    stop_reason: StopReason,
) -> Vec<StreamEvent> {
    std::iter::once(StreamEvent::Start)
        .chain(body)
        .chain(std::iter::once(StreamEvent::Done {
            message,
            stop_reason,
        }))
        .collect()
}

struct Script {
    pending: VecDeque<MockResponse>,
    seen: Vec<LlmContext>,
}

pub struct MockProvider {
    script: Mutex<Script>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            script: Mutex::new(Script {
                pending: responses.into(),
                seen: Vec::new(),
            }),
        }
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().seen.len()
    }

    /// Every context passed to `stream`, oldest first.
    pub fn requests(&self) -> Vec<LlmContext> {
        self.script.lock().seen.clone()
    }

    pub fn push(&self, response: MockResponse) {
        self.script.lock().pending.push_back(response);
    }

    fn next(&self, context: &LlmContext) -> Result<MockResponse, ProviderError> {
        let mut script = self.script.lock();
        script.seen.push(context.clone());
        let call = script.seen.len();
        script.pending.pop_front().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("mock script exhausted at call {call}"))
        })
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> usize {
        200_000
    }

    async fn stream(
        &self,
        context: &LlmContext,
        _options: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        let mut response = self.next(context)?;
        loop {
            response = match response {
                MockResponse::Stream(events) => return Ok(Box::pin(futures::stream::iter(events))),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    *inner
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn chunks_arrive_between_start_and_done() {
        let mock = MockProvider::new(vec![MockResponse::text_chunks(&["hel", "lo"])]);
        let events: Vec<StreamEvent> = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], StreamEvent::Start));
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["hel", "lo"]);
        match &events[3] {
            StreamEvent::Done { message, stop_reason } => {
                assert_eq!(message.text(), "hello");
                assert_eq!(*stop_reason, StopReason::EndTurn);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_call_response_carries_calls() {
        let call = ToolCall::new("read", serde_json::json!({"file_path": "a"}));
        let mock = MockProvider::new(vec![MockResponse::tool_calls(vec![call.clone()])]);
        let msg = mock
            .send(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(msg.tool_calls, vec![call]);
    }

    #[tokio::test]
    async fn script_is_consumed_in_order_and_requests_recorded() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("first")]);
        mock.push(MockResponse::stream_text("second"));
        let ctx = LlmContext::new(vec![Message::user_text("hi")], Vec::new());

        let first = mock.send(&ctx, &StreamOptions::default()).await.unwrap();
        let second = mock.send(&ctx, &StreamOptions::default()).await.unwrap();
        assert_eq!(first.text(), "first");
        assert_eq!(second.text(), "second");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests()[0].messages[0].text(), "hi");
    }

    #[tokio::test]
    async fn exhausted_script_is_an_error() {
        let mock = MockProvider::new(vec![]);
        let result = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidRequest(_))));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nested_delays_accumulate() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(2),
            MockResponse::delayed(
                Duration::from_secs(3),
                MockResponse::Error(ProviderError::RateLimited { retry_after: None }),
            ),
        )]);

        let start = tokio::time::Instant::now();
        let result = mock
            .stream(&LlmContext::empty(), &StreamOptions::default())
            .await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn mid_stream_error_surfaces_from_send() {
        let mock = MockProvider::new(vec![MockResponse::stream_error(ProviderError::Network(
            "reset".into(),
        ))]);
        let err = mock
            .send(&LlmContext::empty(), &StreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Network(_)));
    }
}
