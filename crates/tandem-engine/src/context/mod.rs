//! Bounds a session's message log by replacing old messages with a summary.
//!
//! The manager keeps a running size estimate that is updated on every append
//! and recomputed after each splice. When the estimate passes the high-water
//! mark, the oldest messages (all but the most recent `keep_recent`) are
//! summarized into one system message that records the ids it replaced.

pub mod summarizer;
pub mod tokens;

use std::collections::HashSet;

use tracing::{debug, info};

use tandem_core::errors::ProviderError;
use tandem_core::ids::{MessageId, ToolCallId};
use tandem_core::messages::{Message, Role, ToolCall};

use self::summarizer::Summarizer;
use self::tokens::{estimate_message_tokens, estimate_messages_tokens};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextConfig {
    /// Estimated size above which the log is compacted before the next request.
    pub high_water: usize,
    /// Most recent messages that are never summarized.
    pub keep_recent: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            high_water: 150_000,
            keep_recent: 6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionReport {
    pub summary_id: MessageId,
    /// Messages removed from the log by this splice.
    pub replaced: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

#[derive(Clone, Debug)]
pub struct ContextWindowManager {
    config: ContextConfig,
    estimate: usize,
}

impl ContextWindowManager {
    pub fn new(config: ContextConfig, messages: &[Message]) -> Self {
        Self {
            config,
            estimate: estimate_messages_tokens(messages),
        }
    }

    pub fn config(&self) -> ContextConfig {
        self.config
    }

    pub fn estimate(&self) -> usize {
        self.estimate
    }

    pub fn record_append(&mut self, message: &Message) {
        self.estimate += estimate_message_tokens(message);
    }

    pub fn recalculate(&mut self, messages: &[Message]) {
        self.estimate = estimate_messages_tokens(messages);
    }

    pub fn needs_compaction(&self) -> bool {
        self.estimate > self.config.high_water
    }

    /// Number of leading messages eligible for summarization, or `None` when
    /// there is nothing worth replacing.
    ///
    /// The cut keeps the last `keep_recent` messages and moves further back
    /// while the prefix holds a tool call whose result lies outside it.
    pub fn compaction_cut(&self, messages: &[Message]) -> Option<usize> {
        let mut cut = messages.len().saturating_sub(self.config.keep_recent);
        while cut > 0 {
            match first_unresolved_call(&messages[..cut]) {
                Some(index) => cut = index,
                None => break,
            }
        }
        if cut == 0 || (cut == 1 && messages[0].is_summary()) {
            return None;
        }
        Some(cut)
    }

    /// Summarize the eligible prefix of `messages` and splice the summary in
    /// its place. Returns `Ok(None)` when nothing was eligible. On error the
    /// log is left untouched.
    pub async fn compact(
        &mut self,
        messages: &mut Vec<Message>,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<CompactionReport>, ProviderError> {
        let Some(cut) = self.compaction_cut(messages) else {
            debug!(messages = messages.len(), "nothing eligible for compaction");
            return Ok(None);
        };

        let text = summarizer.summarize(&messages[..cut]).await?;
        let summary = Message::summary(text, replaced_ids(&messages[..cut]));
        let summary_id = summary.id.clone();

        let tokens_before = self.estimate;
        messages.splice(..cut, std::iter::once(summary));
        self.recalculate(messages);

        info!(
            replaced = cut,
            tokens_before,
            tokens_after = self.estimate,
            "compacted session history"
        );
        Ok(Some(CompactionReport {
            summary_id,
            replaced: cut,
            tokens_before,
            tokens_after: self.estimate,
        }))
    }
}

/// Ids of every original message covered by `prefix`, flattening earlier
/// summaries into the ids they stood for.
fn replaced_ids(prefix: &[Message]) -> Vec<MessageId> {
    let mut ids = Vec::new();
    for msg in prefix {
        if msg.is_summary() {
            ids.extend(msg.metadata.summary_of.iter().cloned());
        }
        ids.push(msg.id.clone());
    }
    ids
}

fn result_ids(messages: &[Message]) -> HashSet<&ToolCallId> {
    messages
        .iter()
        .filter(|m| m.role == Role::ToolResult)
        .filter_map(|m| m.tool_call_id.as_ref())
        .collect()
}

/// Index of the first message in `messages` requesting a call whose result
/// is not also in `messages`.
fn first_unresolved_call(messages: &[Message]) -> Option<usize> {
    let resolved = result_ids(messages);
    messages
        .iter()
        .position(|m| m.tool_calls.iter().any(|c| !resolved.contains(&c.id)))
}

/// Tool calls in the log that never received a result.
pub fn unresolved_calls(messages: &[Message]) -> Vec<ToolCall> {
    let resolved = result_ids(messages);
    messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .filter(|c| !resolved.contains(&c.id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FixedSummarizer {
        reply: Result<String, ProviderError>,
        seen: Mutex<Vec<usize>>,
    }

    impl FixedSummarizer {
        fn ok(text: &str) -> Self {
            Self {
                reply: Ok(text.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(ProviderError::Overloaded),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError> {
            self.seen.lock().push(messages.len());
            self.reply.clone()
        }
    }

    fn unit(i: usize) -> Message {
        Message::user_text(format!("message {i}")).with_size_estimate(1)
    }

    fn manager(high_water: usize, keep_recent: usize) -> ContextWindowManager {
        ContextWindowManager::new(
            ContextConfig {
                high_water,
                keep_recent,
            },
            &[],
        )
    }

    #[tokio::test]
    async fn crossing_threshold_keeps_recent_messages_verbatim() {
        let summarizer = FixedSummarizer::ok("done.");
        let mut window = manager(8, 2);
        let mut log = Vec::new();
        let mut compactions = 0;

        for i in 1..=10 {
            let msg = unit(i);
            window.record_append(&msg);
            log.push(msg);
            if window.needs_compaction() {
                let before: Vec<Message> = log[log.len() - 2..].to_vec();
                let report = window.compact(&mut log, &summarizer).await.unwrap().unwrap();
                compactions += 1;

                assert_eq!(i, 9);
                assert_eq!(report.replaced, 7);
                assert_eq!(log.len(), 3);
                assert!(log[0].is_summary());
                assert_eq!(&log[1..], &before[..]);
                assert!(window.estimate() < 8);
            }
        }

        assert_eq!(compactions, 1);
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].metadata.summary_of.len(), 7);
        assert_eq!(log[3].text(), "message 10");
    }

    #[tokio::test]
    async fn summary_lists_replaced_ids_in_order() {
        let summarizer = FixedSummarizer::ok("done.");
        let mut log: Vec<Message> = (0..5).map(unit).collect();
        let log_ids: Vec<MessageId> = log.iter().map(|m| m.id.clone()).collect();
        let mut window = manager(0, 2);

        window.compact(&mut log, &summarizer).await.unwrap();
        assert_eq!(log[0].metadata.summary_of, log_ids[..3].to_vec());
    }

    #[tokio::test]
    async fn resummarizing_flattens_earlier_summary() {
        let summarizer = FixedSummarizer::ok("done.");
        let mut log: Vec<Message> = (0..4).map(unit).collect();
        let first_ids: Vec<MessageId> = log[..2].iter().map(|m| m.id.clone()).collect();
        let mut window = manager(0, 2);
        window.compact(&mut log, &summarizer).await.unwrap();
        let summary_id = log[0].id.clone();

        log.push(unit(4));
        log.push(unit(5));
        window.compact(&mut log, &summarizer).await.unwrap();

        let covered = &log[0].metadata.summary_of;
        assert!(first_ids.iter().all(|id| covered.contains(id)));
        assert!(covered.contains(&summary_id));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn cut_never_splits_a_pending_call() {
        let call = ToolCall::new("bash", serde_json::json!({}));
        let log = vec![
            unit(0),
            unit(1),
            Message::assistant_tool_calls("", vec![call.clone()]),
            unit(3),
            Message::tool_result(call.id, "ok", false),
            unit(5),
        ];
        // Keeping 2 would cut at 4, separating the call at 2 from its result at 4.
        assert_eq!(manager(0, 2).compaction_cut(&log), Some(2));
    }

    #[test]
    fn nothing_to_cut() {
        let window = manager(0, 3);
        assert_eq!(window.compaction_cut(&[unit(0), unit(1)]), None);

        let lone_summary = vec![Message::summary("s", vec![MessageId::new()]), unit(1), unit(2)];
        assert_eq!(manager(0, 2).compaction_cut(&lone_summary), None);

        let call = ToolCall::new("bash", serde_json::json!({}));
        let dangling = vec![
            Message::assistant_tool_calls("", vec![call]),
            unit(1),
            unit(2),
        ];
        assert_eq!(manager(0, 1).compaction_cut(&dangling), None);
    }

    #[tokio::test]
    async fn failed_summary_leaves_log_untouched() {
        let summarizer = FixedSummarizer::failing();
        let mut log: Vec<Message> = (0..5).map(unit).collect();
        let original = log.clone();
        let mut window = manager(2, 2);
        window.recalculate(&log);

        let err = window.compact(&mut log, &summarizer).await.unwrap_err();
        assert!(matches!(err, ProviderError::Overloaded));
        assert_eq!(log, original);
        assert!(window.needs_compaction());
        assert_eq!(summarizer.seen.lock().as_slice(), &[3]);
    }

    #[test]
    fn unresolved_calls_are_listed() {
        let done = ToolCall::new("read", serde_json::json!({}));
        let pending = ToolCall::new("bash", serde_json::json!({}));
        let log = vec![
            Message::assistant_tool_calls("", vec![done.clone(), pending.clone()]),
            Message::tool_result(done.id, "ok", false),
        ];
        let open = unresolved_calls(&log);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, pending.id);
    }
}
