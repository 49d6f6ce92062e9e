//! Worker loop
//!
//! Each worker pulls one ticket at a time from the shared FIFO and owns
//! the job end to end. The job itself runs in its own task so a panic or
//! a runaway backend can be contained: the worker watches the task, a
//! watchdog budget and the cancellation token.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::{Shared, Ticket};
use crate::core::JobState;
use crate::reporter::ExecutionResult;

/// Why the worker stopped watching a job
enum Stop {
    Joined(Result<ExecutionResult, JoinError>),
    OverBudget,
    Unresponsive,
}

/// Decrements the busy counter when the worker leaves a job, however it leaves
struct BusyGuard<'a>(&'a Shared);

impl<'a> BusyGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.busy.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(super) async fn worker_loop(index: usize, shared: Arc<Shared>, intake: Arc<Mutex<mpsc::Receiver<Ticket>>>) {
    debug!("Worker {} started", index);

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let ticket = {
            let mut rx = intake.lock().await;
            tokio::select! {
                ticket = rx.recv() => ticket,
                _ = shared.shutdown.cancelled() => None,
            }
        };
        let Some(ticket) = ticket else {
            break;
        };

        let _busy = BusyGuard::new(&shared);
        process(&shared, ticket).await;
    }

    debug!("Worker {} stopped", index);
}

async fn process(shared: &Arc<Shared>, ticket: Ticket) {
    let id = ticket.payload.id;

    // Cancelled while queued; its result is already recorded
    if !shared.table.advance(id, JobState::Provisioning) {
        debug!("Job {} is no longer queued, skipping", id);
        return;
    }

    info!("Starting job {} ({})", id, ticket.language.id);
    let started = Instant::now();
    let budget = shared.job_budget(&ticket);
    let cancel = ticket.cancel.clone();

    let mut handle = tokio::spawn(run_job(shared.clone(), ticket));

    let stop = tokio::select! {
        biased;
        joined = &mut handle => Stop::Joined(joined),
        _ = tokio::time::sleep(budget) => Stop::OverBudget,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(shared.grace).await;
        } => Stop::Unresponsive,
    };

    let result = match stop {
        Stop::Joined(Ok(result)) => result,
        Stop::Joined(Err(e)) if e.is_panic() => {
            let err = anyhow::anyhow!("Job task panicked: {}", panic_message(e.into_panic()));
            shared.reporter.fault(id, &err, started.elapsed())
        }
        Stop::Joined(Err(e)) => shared.reporter.fault(id, &anyhow::Error::from(e), started.elapsed()),
        Stop::OverBudget => {
            warn!("Job {} exceeded its {:?} budget, aborting", id, budget);
            handle.abort();
            let _ = handle.await;
            shared.reporter.timed_out(id, started.elapsed())
        }
        Stop::Unresponsive => {
            warn!("Job {} did not stop within {:?} of cancellation, aborting", id, shared.grace);
            handle.abort();
            let _ = handle.await;
            shared.reporter.cancelled(id, started.elapsed())
        }
    };

    let outcome = result.outcome;
    if shared.table.finish(id, result).is_some() {
        info!("Job {} finished: {} in {}ms", id, outcome, started.elapsed().as_millis());
    } else {
        warn!("Job {} already had a terminal result, dropping {}", id, outcome);
    }
}

/// Provision, execute and tear down. Always returns a result.
async fn run_job(shared: Arc<Shared>, ticket: Ticket) -> ExecutionResult {
    let id = ticket.payload.id;
    let started = Instant::now();

    let mut sandbox = match shared
        .provisioner
        .provision(id, &ticket.language, &ticket.limits)
        .await
    {
        Ok(sandbox) => sandbox,
        Err(e) => {
            let err = anyhow::Error::from(e).context("Failed to provision sandbox");
            return shared.reporter.fault(id, &err, started.elapsed());
        }
    };

    let table = shared.table.clone();
    let executed = shared
        .executor
        .run(&ticket.payload, &ticket.language, &sandbox, &ticket.cancel, |state| {
            table.advance(id, state);
        })
        .await;

    if let Err(e) = sandbox.destroy().await {
        error!("Failed to destroy sandbox {} of job {}: {:#}", sandbox.id(), id, e);
    }

    match executed {
        Ok(report) => shared.reporter.from_report(id, report),
        Err(_) if ticket.cancel.is_cancelled() => shared.reporter.cancelled(id, started.elapsed()),
        Err(e) => shared.reporter.fault(id, &e, started.elapsed()),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
