//! Registry of live sessions and the single entry point for callers.
//!
//! Each live session owns a [`MessageQueue`] and the [`SessionState`] its
//! turns mutate. Turns run on a per-session driver task that is spawned when
//! the queue admits a message into an empty slot and exits once the queue is
//! drained, so an idle session costs no task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use tandem_core::events::{EventSink, SessionEvent, TurnOutcome};
use tandem_core::ids::{EntryId, JobId, SessionId, TurnId};
use tandem_core::jobs::{JobRegistry, JobSnapshot};
use tandem_core::messages::Message;
use tandem_core::session::{Session, TurnMarker};
use tandem_core::todos::{SharedTodos, TodoItem};
use tandem_store::{SessionStore, SessionSummary};

use crate::context::{unresolved_calls, ContextConfig};
use crate::error::EngineError;
use crate::executor::abandoned_result;
use crate::queue::{Admission, Admitted, EntryKind, MessageQueue, QueueEntry, QueueError};
use crate::turn::{SessionState, TurnEngine};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    /// False when the session was already live.
    pub created: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    Started,
    Queued { position: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub entry_id: EntryId,
    pub status: SubmitStatus,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CancelOptions {
    /// Also kill the session's background jobs.
    pub kill_jobs: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CancelReport {
    pub active_cancelled: bool,
    /// Waiting messages purged by the cancellation.
    pub dropped: usize,
    pub killed_jobs: Vec<JobSnapshot>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ShutdownOptions {
    pub kill_jobs: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    /// Waiting messages that were never run.
    pub rejected: usize,
    pub killed_jobs: Vec<JobSnapshot>,
    /// Jobs still running after shutdown; the caller owns them now.
    pub orphaned_jobs: Vec<JobSnapshot>,
}

/// `"{n} Queued"`, or empty when nothing is waiting.
pub fn queue_indicator(queued: usize) -> String {
    if queued == 0 {
        String::new()
    } else {
        format!("{queued} Queued")
    }
}

struct SessionRuntime {
    id: SessionId,
    queue: MessageQueue,
    state: AsyncMutex<SessionState>,
    todos: SharedTodos,
    last_outcome: parking_lot::Mutex<Option<TurnOutcome>>,
}

impl SessionRuntime {
    fn new(session: Session, context: ContextConfig) -> Self {
        let state = SessionState::new(session, context);
        Self {
            id: state.session.id.clone(),
            queue: MessageQueue::new(CancellationToken::new()),
            todos: state.todos.clone(),
            state: AsyncMutex::new(state),
            last_outcome: parking_lot::Mutex::new(None),
        }
    }
}

pub struct Coordinator {
    engine: Arc<TurnEngine>,
    context: ContextConfig,
    sessions: DashMap<SessionId, Arc<SessionRuntime>>,
    creation_locks: DashMap<SessionId, Arc<AsyncMutex<()>>>,
    /// Sessions shut down since they were last started.
    retired: DashSet<SessionId>,
}

impl Coordinator {
    pub fn new(engine: Arc<TurnEngine>, context: ContextConfig) -> Self {
        Self {
            engine,
            context,
            sessions: DashMap::new(),
            creation_locks: DashMap::new(),
            retired: DashSet::new(),
        }
    }

    pub fn events(&self) -> &EventSink {
        self.engine.events()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.engine.events().subscribe()
    }

    pub fn jobs(&self) -> &JobRegistry {
        self.engine.jobs()
    }

    fn store(&self) -> &Arc<dyn SessionStore> {
        self.engine.store()
    }

    fn live(&self, id: &SessionId) -> Result<Arc<SessionRuntime>, EngineError> {
        self.sessions
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| EngineError::UnknownSession(id.clone()))
    }

    /// Return the live session, loading it from the store or creating it.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn start_or_get_session(&self, id: &SessionId) -> Result<SessionInfo, EngineError> {
        let (_, created) = self.ensure_runtime(id, true).await?;
        Ok(SessionInfo {
            id: id.clone(),
            created,
        })
    }

    async fn ensure_runtime(
        &self,
        id: &SessionId,
        revive: bool,
    ) -> Result<(Arc<SessionRuntime>, bool), EngineError> {
        if let Some(runtime) = self.open_runtime(id) {
            return Ok((runtime, false));
        }

        let lock = Arc::clone(self.creation_locks.entry(id.clone()).or_default().value());
        let guard = lock.lock().await;
        let result = self.load_runtime(id, revive).await;
        drop(guard);
        drop(lock);
        // Waiters still hold a clone; the last one out removes the entry.
        self.creation_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// The live runtime, unless it is closed for shutdown.
    fn open_runtime(&self, id: &SessionId) -> Option<Arc<SessionRuntime>> {
        self.sessions
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .filter(|r| !r.queue.is_closed())
    }

    async fn load_runtime(
        &self,
        id: &SessionId,
        revive: bool,
    ) -> Result<(Arc<SessionRuntime>, bool), EngineError> {
        if let Some(runtime) = self.open_runtime(id) {
            return Ok((runtime, false));
        }
        if !revive && self.retired.contains(id) {
            return Err(EngineError::UnknownSession(id.clone()));
        }
        if let Some(closing) = self.sessions.get(id).map(|r| Arc::clone(r.value())) {
            // Let the closing runtime's last turn save before reloading.
            closing.queue.wait_idle().await;
        }

        let mut session = match self.store().load_session(id).await? {
            Some(session) => session,
            None => Session::new(id.clone()),
        };
        recover_interrupted(&mut session);

        let runtime = Arc::new(SessionRuntime::new(session, self.context));
        self.sessions.insert(id.clone(), Arc::clone(&runtime));
        self.retired.remove(id);
        info!("session started");
        Ok((runtime, true))
    }

    /// Queue `message` on the session. Never waits for a turn to run.
    #[instrument(skip(self, message), fields(session_id = %id))]
    pub async fn submit(
        &self,
        id: &SessionId,
        message: Message,
    ) -> Result<SubmitReceipt, EngineError> {
        let (runtime, _) = self.ensure_runtime(id, false).await?;

        let entry = QueueEntry::message(message);
        let entry_id = entry.id.clone();
        let status = match runtime.queue.enqueue(entry) {
            Ok(Admission::Start(admitted)) => {
                tokio::spawn(drive_session(
                    Arc::clone(&self.engine),
                    Arc::clone(&runtime),
                    admitted,
                ));
                SubmitStatus::Started
            }
            Ok(Admission::Queued { position }) => {
                self.events().emit(SessionEvent::QueueChanged {
                    session_id: id.clone(),
                    queued: position,
                });
                SubmitStatus::Queued { position }
            }
            Ok(other) => {
                return Err(EngineError::Internal(format!(
                    "message entry produced {other:?}"
                )))
            }
            Err(QueueError::Closed) => return Err(EngineError::UnknownSession(id.clone())),
        };
        Ok(SubmitReceipt { entry_id, status })
    }

    /// Cancel the active turn and purge waiting messages. Messages submitted
    /// afterwards run normally. Background jobs keep running unless
    /// `kill_jobs` is set.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn cancel(
        &self,
        id: &SessionId,
        options: CancelOptions,
    ) -> Result<CancelReport, EngineError> {
        let runtime = self.live(id)?;
        let mut report = match runtime.queue.enqueue(QueueEntry::cancel()) {
            Ok(Admission::CancelActive { dropped }) => CancelReport {
                active_cancelled: true,
                dropped: dropped.len(),
                killed_jobs: Vec::new(),
            },
            Ok(_) => CancelReport::default(),
            Err(QueueError::Closed) => return Err(EngineError::UnknownSession(id.clone())),
        };
        if report.dropped > 0 {
            self.events().emit(SessionEvent::QueueChanged {
                session_id: id.clone(),
                queued: 0,
            });
        }
        if options.kill_jobs {
            report.killed_jobs = self.jobs().kill_session(id).await;
        }
        info!(
            active_cancelled = report.active_cancelled,
            dropped = report.dropped,
            killed = report.killed_jobs.len(),
            "cancel requested"
        );
        Ok(report)
    }

    /// Close the session: reject further input, cancel and await the active
    /// turn, then evict it. Background jobs survive unless `kill_jobs` is set.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn shutdown(
        &self,
        id: &SessionId,
        options: ShutdownOptions,
    ) -> Result<ShutdownReport, EngineError> {
        let runtime = self.live(id)?;
        self.retired.insert(id.clone());

        let rejected = runtime.queue.close();
        if !rejected.is_empty() {
            self.events().emit(SessionEvent::QueueChanged {
                session_id: id.clone(),
                queued: 0,
            });
        }
        runtime.queue.wait_idle().await;

        let (killed_jobs, orphaned_jobs) = if options.kill_jobs {
            (self.jobs().kill_session(id).await, Vec::new())
        } else {
            (Vec::new(), self.jobs().running_for_session(id))
        };
        if !orphaned_jobs.is_empty() {
            warn!(
                count = orphaned_jobs.len(),
                "background jobs left running after shutdown"
            );
        }

        // A restart during shutdown may already have installed a new runtime.
        self.sessions
            .remove_if(id, |_, live| Arc::ptr_eq(live, &runtime));
        info!(
            rejected = rejected.len(),
            killed = killed_jobs.len(),
            orphaned = orphaned_jobs.len(),
            "session shut down"
        );
        Ok(ShutdownReport {
            rejected: rejected.len(),
            killed_jobs,
            orphaned_jobs,
        })
    }

    /// Shut down every live session concurrently.
    pub async fn shutdown_all(&self, options: ShutdownOptions) -> Vec<(SessionId, ShutdownReport)> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let reports = futures::future::join_all(ids.iter().map(|id| self.shutdown(id, options))).await;
        ids.into_iter()
            .zip(reports)
            .filter_map(|(id, report)| report.ok().map(|r| (id, r)))
            .collect()
    }

    /// Shut down the session (killing its jobs) and remove it from the store.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), EngineError> {
        if self.sessions.contains_key(id) {
            self.shutdown(id, ShutdownOptions { kill_jobs: true }).await?;
        }
        self.store().delete_session(id).await?;
        Ok(())
    }

    /// Buffered output of a job from `offset`, without waiting for it.
    pub fn job_output(&self, job_id: &JobId, offset: usize) -> Result<JobSnapshot, EngineError> {
        Ok(self.jobs().output_from(job_id, offset)?)
    }

    /// Kill a job. Killing a job that already exited succeeds.
    pub async fn job_kill(&self, job_id: &JobId) -> Result<JobSnapshot, EngineError> {
        Ok(self.jobs().kill(job_id).await?)
    }

    pub fn queued_count(&self, id: &SessionId) -> Result<usize, EngineError> {
        Ok(self.live(id)?.queue.queued_count())
    }

    pub fn queue_indicator(&self, id: &SessionId) -> Result<String, EngineError> {
        self.queued_count(id).map(queue_indicator)
    }

    pub fn is_busy(&self, id: &SessionId) -> Result<bool, EngineError> {
        Ok(self.live(id)?.queue.is_busy())
    }

    pub fn todos(&self, id: &SessionId) -> Result<Vec<TodoItem>, EngineError> {
        Ok(self.live(id)?.todos.snapshot())
    }

    /// Wait until the session has no active or waiting turn; returns the
    /// outcome of the last turn it ran.
    pub async fn wait_idle(&self, id: &SessionId) -> Result<Option<TurnOutcome>, EngineError> {
        let runtime = self.live(id)?;
        runtime.queue.wait_idle().await;
        let outcome = runtime.last_outcome.lock().clone();
        Ok(outcome)
    }

    /// Copy of the session. Waits for an active turn to finish.
    pub async fn session(&self, id: &SessionId) -> Result<Session, EngineError> {
        let runtime = self.live(id)?;
        let state = runtime.state.lock().await;
        Ok(state.session.clone())
    }

    pub fn live_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, EngineError> {
        Ok(self.store().list_sessions().await?)
    }
}

/// Run admitted turns back to back until the queue has nothing left.
async fn drive_session(engine: Arc<TurnEngine>, runtime: Arc<SessionRuntime>, first: Admitted) {
    let mut next = Some(first);
    while let Some(Admitted { entry, cancel }) = next.take() {
        if let EntryKind::Message(message) = entry.kind {
            let turn_id = TurnId::new();
            let mut state = runtime.state.lock().await;
            let run = AssertUnwindSafe(engine.run(&mut state, turn_id.clone(), message, cancel))
                .catch_unwind()
                .await;
            let outcome = match run {
                Ok(report) => report.outcome,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    error!(session_id = %runtime.id, turn_id = %turn_id, reason = %reason, "turn panicked");
                    state.session.turn_state = TurnMarker::Failed;
                    let outcome = TurnOutcome::Failed {
                        kind: "internal".into(),
                        reason: format!("turn panicked: {reason}"),
                    };
                    engine.events().emit(SessionEvent::TurnCompleted {
                        session_id: runtime.id.clone(),
                        turn_id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            };
            drop(state);
            *runtime.last_outcome.lock() = Some(outcome);
        }

        next = runtime.queue.on_turn_complete();
        if next.is_some() {
            engine.events().emit(SessionEvent::QueueChanged {
                session_id: runtime.id.clone(),
                queued: runtime.queue.queued_count(),
            });
        }
    }
}

/// Resolve tool calls left open by a process that stopped mid-turn.
fn recover_interrupted(session: &mut Session) {
    let open = unresolved_calls(&session.messages);
    if !open.is_empty() {
        warn!(
            session_id = %session.id,
            count = open.len(),
            "abandoning tool calls from an interrupted turn"
        );
        for call in &open {
            session
                .messages
                .push(abandoned_result(call, "session was interrupted"));
        }
    }
    if session.turn_state == TurnMarker::Running {
        session.turn_state = TurnMarker::Failed;
    }
}
