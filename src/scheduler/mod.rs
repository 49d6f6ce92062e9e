//! Scheduler module - Job intake, dispatch and lifecycle
//!
//! This module provides:
//! - Non-blocking submission onto a bounded FIFO intake
//! - A fixed pool of workers, which is the global concurrency ceiling
//! - Result retrieval, waiting and cancellation by job id
//! - Graceful shutdown
//!
//! The scheduler does NOT:
//! - Touch sandboxes directly (the worker delegates to the provisioner)
//! - Decide outcomes (the executor and reporter do)

pub mod table;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::core::{JobId, JobRecord, JobState, LimitsOverride, ResourceLimits};
use crate::engine::{JobExecutor, JobPayload};
use crate::error::SubmitError;
use crate::languages::{LanguageRegistry, LanguageSpec};
use crate::reporter::{ExecutionResult, Reporter};
use crate::sandbox::Provisioner;

pub use table::{CancelStatus, JobTable, ResultStatus};

/// A job as submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    #[serde(alias = "source")]
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub limits: Option<LimitsOverride>,
}

impl SubmitRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            stdin: None,
            limits: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitsOverride) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Snapshot of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub backend: &'static str,
    pub workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    pub live_sandboxes: usize,
    pub accepting: bool,
}

/// Dispatch unit travelling through the intake channel
pub(crate) struct Ticket {
    payload: JobPayload,
    language: Arc<LanguageSpec>,
    limits: ResourceLimits,
    cancel: CancellationToken,
}

/// State shared by the scheduler handle and its workers
pub(crate) struct Shared {
    table: Arc<JobTable>,
    provisioner: Arc<Provisioner>,
    executor: JobExecutor,
    reporter: Reporter,
    busy: AtomicUsize,
    shutdown: CancellationToken,
    grace: Duration,
    compile_timeout: Duration,
}

impl Shared {
    /// Upper bound on a job's total run time before the watchdog aborts it
    fn job_budget(&self, ticket: &Ticket) -> Duration {
        let compile = if ticket.language.needs_compile() {
            ticket.language.compile_timeout.unwrap_or(self.compile_timeout)
        } else {
            Duration::ZERO
        };
        compile + Duration::from_millis(ticket.limits.wall_time_ms) + self.grace * 2
    }
}

pub struct Scheduler {
    shared: Arc<Shared>,
    registry: Arc<LanguageRegistry>,
    config: ServiceConfig,
    intake: Mutex<Option<mpsc::Sender<Ticket>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Ticket>>>,
    accepting: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker pool and the result reaper
    pub fn start(config: ServiceConfig, registry: Arc<LanguageRegistry>, provisioner: Arc<Provisioner>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(rx));

        let shared = Arc::new(Shared {
            table: Arc::new(JobTable::new()),
            provisioner,
            executor: JobExecutor::new(&config),
            reporter: Reporter::new(config.max_output_bytes),
            busy: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            grace: config.grace,
            compile_timeout: config.compile_timeout,
        });

        let workers = (0..config.workers)
            .map(|index| tokio::spawn(worker::worker_loop(index, shared.clone(), receiver.clone())))
            .collect();
        let reaper = tokio::spawn(reap_results(shared.clone(), config.result_ttl));

        info!(
            "Scheduler started: {} workers, queue capacity {}, backend {}",
            config.workers,
            config.queue_capacity,
            shared.provisioner.backend_name()
        );

        Self {
            shared,
            registry,
            config,
            intake: Mutex::new(Some(tx)),
            receiver,
            accepting: AtomicBool::new(true),
            workers: Mutex::new(workers),
            reaper: Mutex::new(Some(reaper)),
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Validate and enqueue a job. Never blocks.
    pub fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmitError> {
        if request.code.len() > self.config.max_source_bytes {
            return Err(SubmitError::PayloadTooLarge {
                field: "code",
                size: request.code.len(),
                limit: self.config.max_source_bytes,
            });
        }
        let stdin_len = request.stdin.as_ref().map_or(0, |s| s.len());
        if stdin_len > self.config.max_stdin_bytes {
            return Err(SubmitError::PayloadTooLarge {
                field: "stdin",
                size: stdin_len,
                limit: self.config.max_stdin_bytes,
            });
        }

        let language = self
            .registry
            .lookup(&request.language)
            .ok_or_else(|| SubmitError::UnknownLanguage {
                language: request.language.clone(),
            })?;

        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }

        let limits = language
            .default_limits
            .with_override(&request.limits.unwrap_or_default())
            .clamp_to(&self.config.limit_ceiling);

        let id = JobId::new();
        let cancel = self
            .shared
            .table
            .insert(JobRecord::new(id, language.id.clone(), limits.clone()));
        let ticket = Ticket {
            payload: JobPayload {
                id,
                source: request.code,
                stdin: request.stdin,
            },
            language,
            limits,
            cancel,
        };

        let intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match intake.as_ref() {
            Some(tx) => tx.try_send(ticket),
            None => Err(TrySendError::Closed(ticket)),
        };
        drop(intake);

        match sent {
            Ok(()) => {
                debug!("Job {} queued", id);
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                self.shared.table.remove(id);
                Err(SubmitError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.table.remove(id);
                Err(SubmitError::ShuttingDown)
            }
        }
    }

    /// Current result or state of a job. Idempotent.
    pub fn result(&self, id: JobId) -> ResultStatus {
        self.shared.table.result(id)
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.shared.table.state(id)
    }

    pub fn record(&self, id: JobId) -> Option<JobRecord> {
        self.shared.table.record(id)
    }

    /// Wait for the job's terminal result. `None` if the job is unknown or
    /// was evicted while waiting.
    pub async fn wait(&self, id: JobId) -> Option<Arc<ExecutionResult>> {
        let mut rx = self.shared.table.subscribe(id)?;
        let slot = rx.wait_for(|slot| slot.is_some()).await.ok()?;
        slot.clone()
    }

    pub fn cancel(&self, id: JobId) -> CancelStatus {
        let reporter = &self.shared.reporter;
        let status = self.shared.table.cancel(id, || reporter.cancelled(id, Duration::ZERO));
        if status == CancelStatus::Acknowledged {
            info!("Cancellation requested for job {}", id);
        }
        status
    }

    pub fn status(&self) -> PoolStatus {
        let busy = self.shared.busy.load(Ordering::SeqCst);
        PoolStatus {
            backend: self.shared.provisioner.backend_name(),
            workers: self.config.workers,
            busy,
            idle: self.config.workers.saturating_sub(busy),
            queued: self.shared.table.count_in(JobState::Queued),
            live_sandboxes: self.shared.provisioner.live_sandboxes(),
            accepting: self.accepting.load(Ordering::SeqCst),
        }
    }

    /// Stop intake, reject whatever is still queued and wait up to
    /// `drain_timeout` for running jobs before cancelling them.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Scheduler shutting down");

        self.intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.shutdown.cancel();

        // Idle workers let go of the receiver once the shutdown token fires
        let mut rejected = 0;
        {
            let mut rx = self.receiver.lock().await;
            while let Ok(ticket) = rx.try_recv() {
                let id = ticket.payload.id;
                let result = self.shared.reporter.rejected(id, "Service is shutting down");
                if self.shared.table.finish(id, result).is_some() {
                    rejected += 1;
                }
            }
        }
        if rejected > 0 {
            info!("Rejected {} queued jobs", rejected);
        }

        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = tokio::time::timeout(drain_timeout, join_all(&mut workers))
            .await
            .is_ok();

        if !drained {
            let fired = self.shared.table.cancel_all();
            warn!("Drain timed out, cancelled {} running jobs", fired);
            workers.retain(|handle| !handle.is_finished());
            if tokio::time::timeout(self.shared.grace * 2, join_all(&mut workers))
                .await
                .is_err()
            {
                for handle in &workers {
                    handle.abort();
                }
            }
        }

        if let Some(reaper) = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reaper.abort();
        }
        info!("Scheduler stopped");
    }
}

async fn join_all(handles: &mut [JoinHandle<()>]) {
    for handle in handles.iter_mut() {
        if !handle.is_finished() {
            let _ = handle.await;
        }
    }
}

/// Evict finished results once they are older than `ttl`
async fn reap_results(shared: Arc<Shared>, ttl: Duration) {
    let period = (ttl / 2).clamp(Duration::from_millis(100), Duration::from_secs(60));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = shared.table.evict_expired(ttl);
                if evicted > 0 {
                    debug!("Evicted {} expired results", evicted);
                }
            }
            _ = shared.shutdown.cancelled() => break,
        }
    }
}
