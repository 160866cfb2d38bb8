use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::ids::{JobId, SessionId, ToolCallId, TurnId};
use crate::todos::{TodoItem, TodoProgress};

/// How a turn ended. `Cancelled` is a normal terminal state, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed { kind: String, reason: String },
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }
}

/// State-change notifications consumed by the UI.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "turn_started")]
    TurnStarted {
        session_id: SessionId,
        turn_id: TurnId,
    },

    #[serde(rename = "text_delta")]
    TextDelta {
        session_id: SessionId,
        turn_id: TurnId,
        delta: String,
    },

    #[serde(rename = "tool_call_started")]
    ToolCallStarted {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
    },

    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
        is_error: bool,
        result_preview: String,
        duration_ms: u64,
    },

    #[serde(rename = "background_job_started")]
    BackgroundJobStarted {
        session_id: SessionId,
        job_id: JobId,
        command: String,
    },

    #[serde(rename = "summarization_occurred")]
    SummarizationOccurred {
        session_id: SessionId,
        replaced: usize,
        tokens_before: usize,
        tokens_after: usize,
    },

    #[serde(rename = "summarization_failed")]
    SummarizationFailed {
        session_id: SessionId,
        error: String,
    },

    #[serde(rename = "todos_updated")]
    TodosUpdated {
        session_id: SessionId,
        todos: Vec<TodoItem>,
        progress: Option<TodoProgress>,
    },

    #[serde(rename = "queue_changed")]
    QueueChanged {
        session_id: SessionId,
        queued: usize,
    },

    #[serde(rename = "turn_completed")]
    TurnCompleted {
        session_id: SessionId,
        turn_id: TurnId,
        outcome: TurnOutcome,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TurnStarted { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ToolCallStarted { session_id, .. }
            | Self::ToolCallFinished { session_id, .. }
            | Self::BackgroundJobStarted { session_id, .. }
            | Self::SummarizationOccurred { session_id, .. }
            | Self::SummarizationFailed { session_id, .. }
            | Self::TodosUpdated { session_id, .. }
            | Self::QueueChanged { session_id, .. }
            | Self::TurnCompleted { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStarted { .. } => "turn_started",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallFinished { .. } => "tool_call_finished",
            Self::BackgroundJobStarted { .. } => "background_job_started",
            Self::SummarizationOccurred { .. } => "summarization_occurred",
            Self::SummarizationFailed { .. } => "summarization_failed",
            Self::TodosUpdated { .. } => "todos_updated",
            Self::QueueChanged { .. } => "queue_changed",
            Self::TurnCompleted { .. } => "turn_completed",
        }
    }
}

/// Fire-and-forget publisher over a broadcast channel. Never blocks on consumers.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let event_type = event.event_type();
        if self.tx.send(event).is_err() {
            debug!(event_type, "no event receivers, event dropped");
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}
