//! Per-session admission control.
//!
//! A session has one execution slot. [`MessageQueue::enqueue`] either hands the
//! slot to the new message or parks it behind the active turn; the driver calls
//! [`MessageQueue::on_turn_complete`] exactly once per finished turn to release
//! the slot and collect the next message in arrival order. Neither call waits
//! for a turn.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tandem_core::ids::EntryId;
use tandem_core::messages::Message;

#[derive(Clone, Debug)]
pub enum EntryKind {
    Message(Message),
    Cancel,
}

#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn message(message: Message) -> Self {
        Self::with_kind(EntryKind::Message(message))
    }

    pub fn cancel() -> Self {
        Self::with_kind(EntryKind::Cancel)
    }

    fn with_kind(kind: EntryKind) -> Self {
        Self {
            id: EntryId::new(),
            kind,
            enqueued_at: Utc::now(),
        }
    }
}

/// A message that now owns the execution slot, with the token its turn polls.
#[derive(Debug)]
pub struct Admitted {
    pub entry: QueueEntry,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum Admission {
    /// The slot was free; the caller must start a turn for this entry.
    Start(Admitted),
    /// Parked behind the active turn. `position` is 1-based.
    Queued { position: usize },
    /// The active turn was signalled and these waiting entries were purged.
    CancelActive { dropped: Vec<QueueEntry> },
    /// Cancel request with no active turn.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    active: Option<CancellationToken>,
    closed: bool,
}

pub struct MessageQueue {
    state: Mutex<QueueState>,
    /// Parent of every turn token; cancelled when the queue closes.
    base: CancellationToken,
    busy: watch::Sender<bool>,
}

impl MessageQueue {
    pub fn new(base: CancellationToken) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState::default()),
            base,
            busy,
        }
    }

    pub fn enqueue(&self, entry: QueueEntry) -> Result<Admission, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        match entry.kind {
            EntryKind::Cancel => {
                let dropped: Vec<QueueEntry> = state.entries.drain(..).collect();
                match &state.active {
                    Some(token) => {
                        token.cancel();
                        debug!(dropped = dropped.len(), "cancelled active turn");
                        Ok(Admission::CancelActive { dropped })
                    }
                    None => Ok(Admission::Ignored),
                }
            }
            EntryKind::Message(_) if state.active.is_some() => {
                state.entries.push_back(entry);
                Ok(Admission::Queued {
                    position: state.entries.len(),
                })
            }
            EntryKind::Message(_) => Ok(Admission::Start(self.admit(&mut state, entry))),
        }
    }

    /// Release the slot held by the finished turn and admit the next
    /// waiting message, if any.
    pub fn on_turn_complete(&self) -> Option<Admitted> {
        let mut state = self.state.lock();
        state.active = None;
        match state.entries.pop_front() {
            Some(entry) => Some(self.admit(&mut state, entry)),
            None => {
                self.busy.send_replace(false);
                None
            }
        }
    }

    fn admit(&self, state: &mut QueueState, entry: QueueEntry) -> Admitted {
        let cancel = self.base.child_token();
        state.active = Some(cancel.clone());
        self.busy.send_replace(true);
        Admitted { entry, cancel }
    }

    /// Reject further admission, purge waiting entries, and cancel the
    /// active turn. Returns the purged entries.
    pub fn close(&self) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        state.closed = true;
        self.base.cancel();
        state.entries.drain(..).collect()
    }

    /// Drop waiting entries without touching the active turn.
    pub fn clear_pending(&self) -> Vec<QueueEntry> {
        self.state.lock().entries.drain(..).collect()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().active.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Resolves once no turn holds the slot and nothing is waiting.
    pub async fn wait_idle(&self) {
        let mut rx = self.busy.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }
}
