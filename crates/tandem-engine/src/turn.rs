//! The per-turn state machine.
//!
//! ```text
//! Started -> Requesting -> { ToolExecuting -> Requesting }* -> Completed
//!                 |  ^                                        | Cancelled
//!                 v  |                                        | Failed
//!              Summarizing
//! ```
//!
//! Every transition is one call to `step`. The session log is
//! saved after each append and again at the terminal state. Cancellation is
//! observed before each request, while a request or summary is in flight,
//! and before each tool batch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tandem_core::context::LlmContext;
use tandem_core::errors::ProviderError;
use tandem_core::events::{EventSink, SessionEvent, TurnOutcome};
use tandem_core::ids::TurnId;
use tandem_core::jobs::JobRegistry;
use tandem_core::messages::{Message, ToolCall};
use tandem_core::provider::{LlmProvider, StreamOptions};
use tandem_core::session::{Session, TurnMarker};
use tandem_core::stream::StreamEvent;
use tandem_core::todos::SharedTodos;
use tandem_core::tools::ToolContext;
use tandem_store::SessionStore;

use crate::context::summarizer::{LlmSummarizer, Summarizer};
use crate::context::{unresolved_calls, ContextConfig, ContextWindowManager};
use crate::error::EngineError;
use crate::executor::{abandoned_result, ToolExecutor};

#[derive(Clone, Debug)]
pub struct TurnConfig {
    /// Request/tool round trips allowed before the turn fails.
    pub max_round_trips: u32,
    pub request_timeout: Duration,
    pub system_prompt: Option<String>,
    pub stream_options: StreamOptions,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_round_trips: 50,
            request_timeout: Duration::from_secs(300),
            system_prompt: None,
            stream_options: StreamOptions::default(),
        }
    }
}

/// Everything a turn mutates. Owned by the session and lent to one turn at a time.
#[derive(Debug)]
pub struct SessionState {
    pub session: Session,
    pub window: ContextWindowManager,
    pub todos: SharedTodos,
}

impl SessionState {
    pub fn new(session: Session, context: ContextConfig) -> Self {
        let window = ContextWindowManager::new(context, &session.messages);
        let todos = SharedTodos::new(session.todos.clone());
        Self {
            session,
            window,
            todos,
        }
    }
}

#[derive(Debug)]
pub enum TurnState {
    Started,
    Requesting { round: u32, compacted: bool },
    Summarizing { round: u32 },
    ToolExecuting { round: u32, calls: Vec<ToolCall> },
    Completed,
    Cancelled,
    Failed(EngineError),
}

impl TurnState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Requesting { .. } => "requesting",
            Self::Summarizing { .. } => "summarizing",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed(_))
    }
}

#[derive(Debug)]
pub struct TurnReport {
    pub turn_id: TurnId,
    pub outcome: TurnOutcome,
    /// LLM requests issued by this turn.
    pub rounds: u32,
    pub error: Option<EngineError>,
}

/// Inputs of one in-flight turn.
struct TurnRun<'a> {
    state: &'a mut SessionState,
    turn_id: TurnId,
    input: Option<Message>,
    cancel: CancellationToken,
    rounds: u32,
}

enum Interrupt {
    Cancelled,
    Failed(EngineError),
}

/// Drives one session's request/tool loop from an admitted message to a
/// terminal state.
pub struct TurnEngine {
    provider: Arc<dyn LlmProvider>,
    executor: Arc<ToolExecutor>,
    summarizer: Arc<dyn Summarizer>,
    store: Arc<dyn SessionStore>,
    jobs: JobRegistry,
    events: EventSink,
    working_directory: PathBuf,
    config: TurnConfig,
}

impl TurnEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        executor: Arc<ToolExecutor>,
        store: Arc<dyn SessionStore>,
        config: TurnConfig,
    ) -> Self {
        Self {
            summarizer: Arc::new(LlmSummarizer::new(Arc::clone(&provider))),
            provider,
            executor,
            store,
            jobs: JobRegistry::new(),
            events: EventSink::default(),
            working_directory: PathBuf::from("."),
            config,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_jobs(mut self, jobs: JobRegistry) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_working_directory(mut self, dir: PathBuf) -> Self {
        self.working_directory = dir;
        self
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Run one turn to a terminal state. Never returns early: every path
    /// ends with the terminal save and exactly one `TurnCompleted` event.
    #[instrument(skip(self, state, input, cancel), fields(session_id = %state.session.id, turn_id = %turn_id))]
    pub async fn run(
        &self,
        state: &mut SessionState,
        turn_id: TurnId,
        input: Message,
        cancel: CancellationToken,
    ) -> TurnReport {
        let session_id = state.session.id.clone();
        self.jobs.reap();
        self.events.emit(SessionEvent::TurnStarted {
            session_id: session_id.clone(),
            turn_id: turn_id.clone(),
        });

        let mut run = TurnRun {
            state,
            turn_id,
            input: Some(input),
            cancel,
            rounds: 0,
        };
        let mut current = TurnState::Started;
        while !current.is_terminal() {
            debug!(state = current.name(), "turn transition");
            current = self.step(&mut run, current).await;
        }

        match &current {
            TurnState::Cancelled => close_open_calls(run.state, "turn was cancelled"),
            TurnState::Failed(_) => close_open_calls(run.state, "turn failed"),
            _ => {}
        }

        let (mut outcome, marker, mut error) = terminal(current);
        run.state.session.turn_state = marker;
        if let Err(e) = self.persist(run.state).await {
            if error.is_none() {
                outcome = failed_outcome(&e);
                error = Some(e);
            }
        }

        match &error {
            Some(e) => warn!(kind = e.kind(), error = %e, rounds = run.rounds, "turn failed"),
            None => info!(outcome = outcome.label(), rounds = run.rounds, "turn finished"),
        }
        self.events.emit(SessionEvent::TurnCompleted {
            session_id,
            turn_id: run.turn_id.clone(),
            outcome: outcome.clone(),
        });

        TurnReport {
            turn_id: run.turn_id,
            outcome,
            rounds: run.rounds,
            error,
        }
    }

    async fn step(&self, run: &mut TurnRun<'_>, current: TurnState) -> TurnState {
        match current {
            TurnState::Started => {
                let Some(input) = run.input.take() else {
                    return TurnState::Failed(EngineError::Internal(
                        "turn started without an input message".into(),
                    ));
                };
                run.state.session.turn_state = TurnMarker::Running;
                run.state.session.turn_count += 1;
                match self.append(run.state, input).await {
                    Ok(()) => TurnState::Requesting {
                        round: 1,
                        compacted: false,
                    },
                    Err(e) => TurnState::Failed(e),
                }
            }

            TurnState::Requesting { round, compacted } => {
                if run.cancel.is_cancelled() {
                    return TurnState::Cancelled;
                }
                if round > self.config.max_round_trips {
                    return TurnState::Failed(EngineError::TurnLimitExceeded(
                        self.config.max_round_trips,
                    ));
                }
                if !compacted && run.state.window.needs_compaction() {
                    return TurnState::Summarizing { round };
                }

                run.rounds = round;
                let message = match self.request(run).await {
                    Ok(message) => message,
                    Err(Interrupt::Cancelled) => return TurnState::Cancelled,
                    Err(Interrupt::Failed(e)) => return TurnState::Failed(e),
                };
                let calls = message.tool_calls.clone();
                if let Err(e) = self.append(run.state, message).await {
                    return TurnState::Failed(e);
                }
                if calls.is_empty() {
                    TurnState::Completed
                } else {
                    TurnState::ToolExecuting { round, calls }
                }
            }

            TurnState::Summarizing { round } => self.summarize(run, round).await,

            TurnState::ToolExecuting { round, calls } => {
                if run.cancel.is_cancelled() {
                    for call in &calls {
                        let abandoned = abandoned_result(call, "turn was cancelled");
                        if let Err(e) = self.append(run.state, abandoned).await {
                            return TurnState::Failed(e);
                        }
                    }
                    return TurnState::Cancelled;
                }

                let ctx = self.tool_context(run);
                let batch = self.executor.execute_batch(&calls, &ctx).await;
                for result in batch.results {
                    if let Err(e) = self.append(run.state, result).await {
                        return TurnState::Failed(e);
                    }
                }
                if let Some(fatal) = batch.fatal {
                    return TurnState::Failed(EngineError::ToolFatal {
                        tool: fatal.tool,
                        message: fatal.message,
                    });
                }
                if batch.cancelled || run.cancel.is_cancelled() {
                    return TurnState::Cancelled;
                }
                TurnState::Requesting {
                    round: round + 1,
                    compacted: false,
                }
            }

            terminal @ (TurnState::Completed | TurnState::Cancelled | TurnState::Failed(_)) => {
                terminal
            }
        }
    }

    /// Compact the log ahead of a request. Failure leaves the log as it was
    /// and the turn continues; the next request tries again.
    async fn summarize(&self, run: &mut TurnRun<'_>, round: u32) -> TurnState {
        let session_id = run.state.session.id.clone();
        let SessionState {
            session, window, ..
        } = &mut *run.state;

        let compaction = tokio::select! {
            biased;
            () = run.cancel.cancelled() => return TurnState::Cancelled,
            result = window.compact(&mut session.messages, self.summarizer.as_ref()) => result,
        };

        match compaction {
            Ok(Some(report)) => {
                self.events.emit(SessionEvent::SummarizationOccurred {
                    session_id,
                    replaced: report.replaced,
                    tokens_before: report.tokens_before,
                    tokens_after: report.tokens_after,
                });
                if let Err(e) = self.persist(run.state).await {
                    return TurnState::Failed(e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "summarization failed, continuing with full history");
                self.events.emit(SessionEvent::SummarizationFailed {
                    session_id,
                    error: e.to_string(),
                });
            }
        }
        TurnState::Requesting {
            round,
            compacted: true,
        }
    }

    async fn request(&self, run: &TurnRun<'_>) -> Result<Message, Interrupt> {
        let mut context = LlmContext::new(
            run.state.session.messages.clone(),
            self.executor.definitions(),
        );
        if let Some(prompt) = &self.config.system_prompt {
            context = context.with_system_prompt(prompt.clone());
        }

        let timeout = self.config.request_timeout;
        tokio::select! {
            biased;
            () = run.cancel.cancelled() => Err(Interrupt::Cancelled),
            result = tokio::time::timeout(timeout, self.stream_reply(&context, run)) => match result {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(e)) => {
                    warn!(error = %e, kind = e.error_kind(), "provider request failed");
                    Err(Interrupt::Failed(e.into()))
                }
                Err(_) => {
                    warn!(?timeout, "provider request timed out");
                    Err(Interrupt::Failed(ProviderError::Timeout(timeout).into()))
                }
            },
        }
    }

    async fn stream_reply(
        &self,
        context: &LlmContext,
        run: &TurnRun<'_>,
    ) -> Result<Message, ProviderError> {
        let mut stream = self
            .provider
            .stream(context, &self.config.stream_options)
            .await?;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { delta } => {
                    self.events.emit(SessionEvent::TextDelta {
                        session_id: run.state.session.id.clone(),
                        turn_id: run.turn_id.clone(),
                        delta,
                    });
                }
                StreamEvent::Done { message, .. } => return Ok(message),
                StreamEvent::Error { error } => return Err(error),
                _ => {}
            }
        }
        Err(ProviderError::StreamInterrupted(
            "stream ended without a final message".into(),
        ))
    }

    fn tool_context(&self, run: &TurnRun<'_>) -> ToolContext {
        ToolContext {
            session_id: run.state.session.id.clone(),
            working_directory: self.working_directory.clone(),
            cancel: run.cancel.clone(),
            jobs: self.jobs.clone(),
            todos: run.state.todos.clone(),
            events: self.events.clone(),
        }
    }

    async fn append(&self, state: &mut SessionState, message: Message) -> Result<(), EngineError> {
        state.window.record_append(&message);
        state.session.messages.push(message);
        self.persist(state).await
    }

    async fn persist(&self, state: &mut SessionState) -> Result<(), EngineError> {
        state.session.todos = state.todos.snapshot();
        state.session.touch();
        self.store.save_session(&state.session).await.map_err(|e| {
            error!(error = %e, "failed to save session");
            EngineError::Persistence(e)
        })
    }
}

/// Give every call still lacking a result an abandoned one, so the log a
/// later turn sends never carries a dangling call. Saved by the terminal
/// persist.
fn close_open_calls(state: &mut SessionState, reason: &str) {
    for call in unresolved_calls(&state.session.messages) {
        let result = abandoned_result(&call, reason);
        state.window.record_append(&result);
        state.session.messages.push(result);
    }
}

fn failed_outcome(error: &EngineError) -> TurnOutcome {
    TurnOutcome::Failed {
        kind: error.kind().to_string(),
        reason: error.to_string(),
    }
}

fn terminal(state: TurnState) -> (TurnOutcome, TurnMarker, Option<EngineError>) {
    match state {
        TurnState::Completed => (TurnOutcome::Completed, TurnMarker::Completed, None),
        TurnState::Cancelled => (TurnOutcome::Cancelled, TurnMarker::Cancelled, None),
        TurnState::Failed(e) => (failed_outcome(&e), TurnMarker::Failed, Some(e)),
        other => {
            let e = EngineError::Internal(format!("turn stopped in state {}", other.name()));
            (failed_outcome(&e), TurnMarker::Failed, Some(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::registry::ToolRegistry;
    use crate::testing::{
        assert_calls_resolved, registry_with, FailTool, FailingStore, GateTool, SleepTool,
    };
    use crate::tools::todos::TodosTool;
    use tandem_core::ids::SessionId;
    use tandem_core::messages::Role;
    use tandem_core::todos::TodoStatus;
    use tandem_core::tools::Tool;
    use tandem_llm::{MockProvider, MockResponse};
    use tandem_store::MemorySessionStore;
    use tokio::sync::broadcast;

    fn engine(
        provider: &Arc<MockProvider>,
        registry: ToolRegistry,
        store: Arc<dyn SessionStore>,
        config: TurnConfig,
    ) -> Arc<TurnEngine> {
        let executor = Arc::new(ToolExecutor::new(
            registry,
            ExecutorConfig {
                tool_timeout: Duration::from_secs(5),
                background_grace: Duration::from_millis(20),
            },
        ));
        Arc::new(
            TurnEngine::new(provider.clone(), executor, store, config)
                .with_working_directory(std::env::temp_dir()),
        )
    }

    fn simple_engine(provider: &Arc<MockProvider>, tools: Vec<Arc<dyn Tool>>) -> Arc<TurnEngine> {
        engine(
            provider,
            registry_with(tools),
            Arc::new(MemorySessionStore::new()),
            TurnConfig::default(),
        )
    }

    fn new_state() -> SessionState {
        SessionState::new(Session::new(SessionId::new()), ContextConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn failure_kind(outcome: &TurnOutcome) -> &str {
        match outcome {
            TurnOutcome::Failed { kind, .. } => kind,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_reply_completes_turn() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("hello")]));
        let store = Arc::new(MemorySessionStore::new());
        let engine = engine(&provider, ToolRegistry::new(), store.clone(), TurnConfig::default());
        let mut rx = engine.events().subscribe();
        let mut state = new_state();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("hi"), CancellationToken::new())
            .await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.rounds, 1);
        assert_eq!(state.session.messages.len(), 2);
        assert_eq!(state.session.messages[1].text(), "hello");
        assert_eq!(state.session.turn_state, TurnMarker::Completed);
        assert_eq!(state.session.turn_count, 1);

        let saved = store.load_session(&state.session.id).await.unwrap().unwrap();
        assert_eq!(saved.messages, state.session.messages);
        assert_eq!(saved.turn_state, TurnMarker::Completed);

        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::TurnStarted { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::TextDelta { delta, .. } if delta == "hello")));
        assert!(matches!(
            events.last(),
            Some(SessionEvent::TurnCompleted {
                outcome: TurnOutcome::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn tool_round_trip_feeds_results_back() {
        let call = ToolCall::new("seq", serde_json::json!({"tag": "x"}));
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(vec![call.clone()]),
            MockResponse::stream_text("all done"),
        ]));
        let engine = simple_engine(
            &provider,
            vec![Arc::new(SleepTool::sequential("seq", Duration::ZERO))],
        );
        let mut state = new_state();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("go"), CancellationToken::new())
            .await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.rounds, 2);
        let roles: Vec<Role> = state.session.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]
        );
        assert_eq!(state.session.messages[2].tool_call_id, Some(call.id));
        assert_eq!(state.session.messages[2].text(), "seq done: x");

        let second = &provider.requests()[1];
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.tools.len(), 1);
    }

    #[tokio::test]
    async fn round_trip_limit_fails_turn() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(vec![ToolCall::new("seq", serde_json::json!({}))]),
            MockResponse::tool_calls(vec![ToolCall::new("seq", serde_json::json!({}))]),
            MockResponse::stream_text("never requested"),
        ]));
        let engine = engine(
            &provider,
            registry_with(vec![Arc::new(SleepTool::sequential("seq", Duration::ZERO))]),
            Arc::new(MemorySessionStore::new()),
            TurnConfig {
                max_round_trips: 2,
                ..TurnConfig::default()
            },
        );
        let mut state = new_state();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("loop"), CancellationToken::new())
            .await;

        assert_eq!(failure_kind(&report.outcome), "turn_limit_exceeded");
        assert!(matches!(report.error, Some(EngineError::TurnLimitExceeded(2))));
        assert_eq!(provider.call_count(), 2);
        assert_eq!(state.session.turn_state, TurnMarker::Failed);
        assert_calls_resolved(&state.session.messages);
    }

    #[tokio::test]
    async fn fatal_tool_error_fails_turn() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::tool_calls(vec![
            ToolCall::new("broken", serde_json::json!({})),
        ])]));
        let engine = simple_engine(&provider, vec![Arc::new(FailTool::fatal("broken"))]);
        let mut state = new_state();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("go"), CancellationToken::new())
            .await;

        assert_eq!(failure_kind(&report.outcome), "tool_fatal");
        assert_eq!(provider.call_count(), 1);
        assert_calls_resolved(&state.session.messages);
    }

    #[tokio::test]
    async fn recoverable_tool_error_is_fed_back() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(vec![ToolCall::new("flaky", serde_json::json!({}))]),
            MockResponse::stream_text("I'll try something else"),
        ]));
        let engine = simple_engine(&provider, vec![Arc::new(FailTool::recoverable("flaky"))]);
        let mut state = new_state();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("go"), CancellationToken::new())
            .await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert!(state.session.messages[2].is_error);
    }

    #[tokio::test]
    async fn rate_limit_and_auth_failures_are_distinguished() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::Error(ProviderError::RateLimited { retry_after: None }),
            MockResponse::Error(ProviderError::AuthenticationFailed("bad key".into())),
        ]));
        let engine = simple_engine(&provider, Vec::new());
        let mut state = new_state();

        let limited = engine
            .run(&mut state, TurnId::new(), Message::user_text("a"), CancellationToken::new())
            .await;
        assert_eq!(failure_kind(&limited.outcome), "provider_rate_limited");

        let fatal = engine
            .run(&mut state, TurnId::new(), Message::user_text("b"), CancellationToken::new())
            .await;
        assert_eq!(failure_kind(&fatal.outcome), "provider_fatal");
        match fatal.outcome {
            TurnOutcome::Failed { reason, .. } => assert!(reason.contains("bad key")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(state.session.turn_count, 2);
    }

    #[tokio::test]
    async fn persistence_failure_fails_turn() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("hi")]));
        let engine = engine(
            &provider,
            ToolRegistry::new(),
            Arc::new(FailingStore::failing()),
            TurnConfig::default(),
        );
        let mut rx = engine.events().subscribe();
        let mut state = new_state();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("hi"), CancellationToken::new())
            .await;

        assert_eq!(failure_kind(&report.outcome), "persistence");
        assert_eq!(provider.call_count(), 0);
        let completed = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::TurnCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn failed_save_after_tool_request_still_resolves_calls() {
        // Save 1 stores the user message; save 2 (the assistant's tool call) fails.
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(vec![ToolCall::new("seq", serde_json::json!({}))]),
            MockResponse::stream_text("next turn"),
        ]));
        let engine = engine(
            &provider,
            registry_with(vec![Arc::new(SleepTool::sequential("seq", Duration::ZERO))]),
            Arc::new(FailingStore::failing_from(2)),
            TurnConfig::default(),
        );
        let mut state = new_state();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("go"), CancellationToken::new())
            .await;

        assert_eq!(failure_kind(&report.outcome), "persistence");
        let roles: Vec<Role> = state.session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::ToolResult]);
        assert!(state.session.messages[2].is_error);
        assert!(state.session.messages[2].text().contains("abandoned"));
        assert_calls_resolved(&state.session.messages);
        assert_eq!(
            state.window.estimate(),
            crate::context::tokens::estimate_messages_tokens(&state.session.messages)
        );
    }

    #[tokio::test]
    async fn cancelled_before_request() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("hi")]));
        let engine = simple_engine(&provider, Vec::new());
        let mut state = new_state();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine
            .run(&mut state, TurnId::new(), Message::user_text("hi"), cancel)
            .await;

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(state.session.messages.len(), 1);
        assert_eq!(state.session.turn_state, TurnMarker::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_streaming_request() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::stream_text("too late"),
        )]));
        let engine = simple_engine(&provider, Vec::new());
        let cancel = CancellationToken::new();

        let task = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut state = new_state();
                let report = engine
                    .run(&mut state, TurnId::new(), Message::user_text("hi"), cancel)
                    .await;
                (report, state)
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let (report, state) = task.await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(state.session.messages.len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_tool_leaves_no_dangling_call() {
        let gate = Arc::new(GateTool::new());
        let started = gate.started.clone();
        let provider = Arc::new(MockProvider::new(vec![MockResponse::tool_calls(vec![
            ToolCall::new("gate", serde_json::json!({})),
            ToolCall::new("gate", serde_json::json!({})),
        ])]));
        let engine = simple_engine(&provider, vec![gate]);
        let cancel = CancellationToken::new();

        let task = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut state = new_state();
                let report = engine
                    .run(&mut state, TurnId::new(), Message::user_text("hi"), cancel)
                    .await;
                (report, state)
            })
        };
        started.notified().await;
        cancel.cancel();

        let (report, state) = task.await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(provider.call_count(), 1);
        assert_calls_resolved(&state.session.messages);
        let results: Vec<&Message> = state
            .session
            .messages
            .iter()
            .filter(|m| m.role == Role::ToolResult)
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|m| m.is_error));
        assert!(results[1].text().contains("turn was cancelled"));
    }

    fn unit_history(count: usize) -> Session {
        let mut session = Session::new(SessionId::new());
        for i in 0..count {
            session
                .messages
                .push(Message::user_text(format!("m{i}")).with_size_estimate(1));
        }
        session
    }

    fn small_window() -> ContextConfig {
        ContextConfig {
            high_water: 8,
            keep_recent: 2,
        }
    }

    #[tokio::test]
    async fn overflow_summarizes_before_request() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::stream_text("earlier work summarized"),
            MockResponse::stream_text("reply"),
        ]));
        let engine = simple_engine(&provider, Vec::new());
        let mut rx = engine.events().subscribe();
        let mut state = SessionState::new(unit_history(8), small_window());
        let last_original = state.session.messages[7].clone();

        let input = Message::user_text("go").with_size_estimate(1);
        let report = engine
            .run(&mut state, TurnId::new(), input.clone(), CancellationToken::new())
            .await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        let log = &state.session.messages;
        assert_eq!(log.len(), 4);
        assert!(log[0].is_summary());
        assert_eq!(log[0].metadata.summary_of.len(), 7);
        assert_eq!(log[1], last_original);
        assert_eq!(log[2], input);
        assert_eq!(log[3].text(), "reply");

        let request = &provider.requests()[1];
        assert_eq!(request.messages.len(), 3);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::SummarizationOccurred { replaced: 7, .. })));
    }

    #[tokio::test]
    async fn failed_summarization_is_not_fatal() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::Error(ProviderError::Overloaded),
            MockResponse::stream_text("reply"),
        ]));
        let engine = simple_engine(&provider, Vec::new());
        let mut rx = engine.events().subscribe();
        let mut state = SessionState::new(unit_history(8), small_window());

        let report = engine
            .run(
                &mut state,
                TurnId::new(),
                Message::user_text("go").with_size_estimate(1),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(state.session.messages.len(), 10);
        assert!(!state.session.messages.iter().any(Message::is_summary));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::SummarizationFailed { .. })));
    }

    #[tokio::test]
    async fn todo_updates_are_persisted_with_session() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(vec![ToolCall::new(
                "todos",
                serde_json::json!({"todos": [{
                    "content": "Run tests",
                    "status": "in_progress",
                    "active_form": "Running tests"
                }]}),
            )]),
            MockResponse::stream_text("tracking it"),
        ]));
        let store = Arc::new(MemorySessionStore::new());
        let engine = engine(
            &provider,
            registry_with(vec![Arc::new(TodosTool)]),
            store.clone(),
            TurnConfig::default(),
        );
        let mut state = new_state();

        engine
            .run(&mut state, TurnId::new(), Message::user_text("plan"), CancellationToken::new())
            .await;

        assert_eq!(state.session.todos.len(), 1);
        assert_eq!(state.session.todos[0].status, TodoStatus::InProgress);
        let saved = store.load_session(&state.session.id).await.unwrap().unwrap();
        assert_eq!(saved.todos, state.session.todos);
    }

    #[test]
    fn state_names() {
        assert_eq!(TurnState::Requesting { round: 1, compacted: false }.name(), "requesting");
        assert!(TurnState::Failed(EngineError::TurnLimitExceeded(1)).is_terminal());
        assert!(!TurnState::Summarizing { round: 1 }.is_terminal());
    }
}
