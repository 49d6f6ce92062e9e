//! Job table
//!
//! Authoritative record of every job the scheduler accepted. All state
//! changes go through here under one lock so cancellation and completion
//! can never both win.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::{JobId, JobRecord, JobState};
use crate::reporter::ExecutionResult;

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Acknowledged,
    AlreadyTerminal,
    NotFound,
}

/// What a result query found
#[derive(Debug, Clone)]
pub enum ResultStatus {
    Ready(Arc<ExecutionResult>),
    Pending(JobState),
    NotFound,
}

type ResultSlot = Option<Arc<ExecutionResult>>;

struct Entry {
    record: JobRecord,
    cancel: CancellationToken,
    done: watch::Sender<ResultSlot>,
}

#[derive(Default)]
pub struct JobTable {
    entries: Mutex<HashMap<JobId, Entry>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new queued job and hand back its cancellation token
    pub fn insert(&self, record: JobRecord) -> CancellationToken {
        let cancel = CancellationToken::new();
        let (done, _) = watch::channel(None);
        self.entries().insert(
            record.id,
            Entry {
                record,
                cancel: cancel.clone(),
                done,
            },
        );
        cancel
    }

    /// Forget a job that never made it into the queue
    pub fn remove(&self, id: JobId) {
        self.entries().remove(&id);
    }

    /// Move a live job forward. Returns false if the job is unknown or the
    /// transition is not allowed (e.g. it was cancelled while queued).
    pub fn advance(&self, id: JobId, state: JobState) -> bool {
        match self.entries().get_mut(&id) {
            Some(entry) => entry.record.advance(state).is_ok(),
            None => false,
        }
    }

    /// Store the terminal result. The first terminal transition wins; later
    /// ones are ignored and return `None`.
    pub fn finish(&self, id: JobId, result: ExecutionResult) -> Option<Arc<ExecutionResult>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(&id)?;
        entry.record.advance(result.outcome.terminal_state()).ok()?;

        let result = Arc::new(result);
        entry.done.send_replace(Some(result.clone()));
        Some(result)
    }

    /// Cancel a job. Queued jobs are finished on the spot with the result
    /// built by `cancelled`; later stages get their token fired.
    pub fn cancel<F>(&self, id: JobId, cancelled: F) -> CancelStatus
    where
        F: FnOnce() -> ExecutionResult,
    {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            return CancelStatus::NotFound;
        };
        if entry.record.state.is_terminal() {
            return CancelStatus::AlreadyTerminal;
        }

        entry.cancel.cancel();
        if entry.record.state == JobState::Queued && entry.record.advance(JobState::Cancelled).is_ok() {
            entry.done.send_replace(Some(Arc::new(cancelled())));
        }
        CancelStatus::Acknowledged
    }

    /// Fire the token of every job that has not finished
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries();
        let mut fired = 0;
        for entry in entries.values().filter(|e| !e.record.state.is_terminal()) {
            entry.cancel.cancel();
            fired += 1;
        }
        fired
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.entries().get(&id).map(|e| e.record.state)
    }

    pub fn record(&self, id: JobId) -> Option<JobRecord> {
        self.entries().get(&id).map(|e| e.record.clone())
    }

    pub fn result(&self, id: JobId) -> ResultStatus {
        match self.entries().get(&id) {
            Some(entry) => match entry.done.borrow().clone() {
                Some(result) => ResultStatus::Ready(result),
                None => ResultStatus::Pending(entry.record.state),
            },
            None => ResultStatus::NotFound,
        }
    }

    /// Watch for the job's terminal result
    pub fn subscribe(&self, id: JobId) -> Option<watch::Receiver<ResultSlot>> {
        self.entries().get(&id).map(|e| e.done.subscribe())
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.entries().values().filter(|e| e.record.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop finished jobs older than `ttl`. Returns how many were evicted.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - ttl;

        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| match e.record.finished_at {
            Some(finished_at) => finished_at > cutoff,
            None => true,
        });
        before - entries.len()
    }
}
