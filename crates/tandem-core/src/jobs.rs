//! Registry of background jobs that may outlive the turn that started them.
//!
//! Jobs are owned by the registry and referenced by id from tool calls. A job
//! leaves the registry only through [`JobRegistry::reap`] (finished and its
//! final output observed) or [`JobRegistry::kill_session`] (forced teardown).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ids::{JobId, SessionId};

const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Exited { code: Option<i32> },
    Killed,
    Failed { message: String },
}

impl JobStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Append-only text buffer shared between one writer and any number of readers.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer {
    inner: Arc<RwLock<String>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &str) {
        if !chunk.is_empty() {
            self.inner.write().push_str(chunk);
        }
    }

    pub fn snapshot(&self) -> String {
        self.inner.read().clone()
    }

    /// Everything appended at or after byte `offset`.
    pub fn read_from(&self, offset: usize) -> String {
        self.window(offset, usize::MAX).text
    }

    /// At most `max_bytes` starting at byte `offset`, with the offset to
    /// continue from and the buffer length, all taken under one read lock.
    /// Both ends snap back to char boundaries; a window never comes back
    /// empty while unread text remains.
    pub fn window(&self, offset: usize, max_bytes: usize) -> OutputWindow {
        let buf = self.inner.read();
        let start = floor_boundary(&buf, offset);
        let mut end = floor_boundary(&buf, start.saturating_add(max_bytes));
        if end == start && start < buf.len() {
            end = buf[start..]
                .chars()
                .next()
                .map_or(buf.len(), |c| start + c.len_utf8());
        }
        OutputWindow {
            text: buf[start..end].to_string(),
            next_offset: end,
            total: buf.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn floor_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputWindow {
    pub text: String,
    pub next_offset: usize,
    pub total: usize,
}

/// Point-in-time view of a job returned by output and kill queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub command: String,
    pub status: JobStatus,
    pub finished: bool,
    pub output: String,
    /// Offset just past `output`; pass it back to continue reading.
    pub next_offset: usize,
    /// Total bytes buffered when the snapshot was taken.
    pub output_len: usize,
    pub started_at: DateTime<Utc>,
}

pub struct BackgroundJob {
    id: JobId,
    session_id: SessionId,
    command: String,
    started_at: DateTime<Utc>,
    output: OutputBuffer,
    status: watch::Sender<JobStatus>,
    kill_signal: CancellationToken,
    exit_observed: AtomicBool,
}

impl BackgroundJob {
    pub fn new(session_id: SessionId, command: impl Into<String>) -> Self {
        let (status, _) = watch::channel(JobStatus::Running);
        Self {
            id: JobId::new(),
            session_id,
            command: command.into(),
            started_at: Utc::now(),
            output: OutputBuffer::new(),
            status,
            kill_signal: CancellationToken::new(),
            exit_observed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        !self.status.borrow().is_running()
    }

    /// Token the process driver watches to know it must terminate the job.
    pub fn kill_signal(&self) -> CancellationToken {
        self.kill_signal.clone()
    }

    /// Record a terminal status. The first terminal status wins.
    pub fn finish(&self, status: JobStatus) -> bool {
        if status.is_running() {
            return false;
        }
        self.status.send_if_modified(|current| {
            if current.is_running() {
                *current = status;
                true
            } else {
                false
            }
        })
    }

    /// Wait up to `timeout` for a terminal status. Returns whether it was reached.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut rx = self.status.subscribe();
        let finished = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_running())).await,
            Ok(Ok(_))
        );
        finished
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.page(0, usize::MAX)
    }

    /// Snapshot carrying at most `max_bytes` of output from `offset`.
    /// Does not mark the output as observed.
    pub fn page(&self, offset: usize, max_bytes: usize) -> JobSnapshot {
        // Status first: output read afterwards is at least as complete as the status implies.
        let status = self.status();
        let window = self.output.window(offset, max_bytes);
        JobSnapshot {
            job_id: self.id.clone(),
            session_id: self.session_id.clone(),
            command: self.command.clone(),
            finished: !status.is_running(),
            status,
            output: window.text,
            next_offset: window.next_offset,
            output_len: window.total,
            started_at: self.started_at,
        }
    }

    fn exit_observed(&self) -> bool {
        self.exit_observed.load(Ordering::Acquire)
    }
}

/// Shared map of live background jobs, keyed by id.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<JobId, Arc<BackgroundJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: BackgroundJob) -> Arc<BackgroundJob> {
        let job = Arc::new(job);
        debug!(job_id = %job.id, session_id = %job.session_id, command = %job.command, "background job registered");
        self.jobs.insert(job.id.clone(), Arc::clone(&job));
        job
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<BackgroundJob>> {
        self.jobs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Current output without waiting for the job. Reading a finished job's
    /// output through to its end marks it as observed.
    pub fn output(&self, id: &JobId) -> Result<JobSnapshot, JobError> {
        self.output_from(id, 0)
    }

    pub fn output_from(&self, id: &JobId, offset: usize) -> Result<JobSnapshot, JobError> {
        self.output_page(id, offset, usize::MAX)
    }

    /// Like [`JobRegistry::output_from`] but returns at most `max_bytes`;
    /// page with the snapshot's `next_offset`.
    pub fn output_page(
        &self,
        id: &JobId,
        offset: usize,
        max_bytes: usize,
    ) -> Result<JobSnapshot, JobError> {
        let job = self.get(id).ok_or_else(|| JobError::UnknownJob(id.clone()))?;
        let snapshot = job.page(offset, max_bytes);
        if snapshot.finished && snapshot.next_offset == snapshot.output_len {
            job.exit_observed.store(true, Ordering::Release);
        }
        Ok(snapshot)
    }

    /// Terminate a job. Killing a job that already exited is a no-op.
    pub async fn kill(&self, id: &JobId) -> Result<JobSnapshot, JobError> {
        let job = self.get(id).ok_or_else(|| JobError::UnknownJob(id.clone()))?;
        kill_job(&job).await;
        Ok(job.snapshot())
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.jobs.iter().map(|e| e.value().snapshot()).collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    pub fn for_session(&self, session_id: &SessionId) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .filter(|e| e.value().session_id == *session_id)
            .map(|e| e.value().snapshot())
            .collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    pub fn running_for_session(&self, session_id: &SessionId) -> Vec<JobSnapshot> {
        self.for_session(session_id)
            .into_iter()
            .filter(|j| !j.finished)
            .collect()
    }

    /// Kill every job the session still owns and drop them from the registry.
    pub async fn kill_session(&self, session_id: &SessionId) -> Vec<JobSnapshot> {
        let owned: Vec<Arc<BackgroundJob>> = self
            .jobs
            .iter()
            .filter(|e| e.value().session_id == *session_id)
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut killed = Vec::new();
        for job in owned {
            if !job.is_finished() {
                kill_job(&job).await;
                killed.push(job.snapshot());
            }
            self.jobs.remove(&job.id);
        }
        killed
    }

    /// Remove jobs that are finished and whose final output has been observed.
    pub fn reap(&self) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.is_finished() && job.exit_observed()));
        let reaped = before.saturating_sub(self.jobs.len());
        if reaped > 0 {
            debug!(reaped, "reaped background jobs");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

async fn kill_job(job: &BackgroundJob) {
    if job.is_finished() {
        return;
    }
    job.kill_signal.cancel();
    if !job.wait_finished(KILL_WAIT).await {
        warn!(job_id = %job.id, "job did not report exit after kill, marking killed");
        job.finish(JobStatus::Killed);
    }
}
