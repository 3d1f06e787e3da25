//! Worker threads backing a [`Scheduler`](super::Scheduler).

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::core::error::EngineError;
use crate::core::job::ErrorEvent;
use crate::core::performer::{panic_message, ExecutionContext, ExecutionResult};

use super::SchedulerInner;

/// Permission for one worker to run one drain cycle.
pub(super) struct WorkToken;

/// The worker threads started by one `start()`.
pub(super) struct Generation {
    done: Receiver<()>,
    cancel: watch::Sender<bool>,
}

impl Generation {
    pub(super) fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(super) fn done(&self) -> Receiver<()> {
        self.done.clone()
    }

    pub(super) fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

/// Block until every worker dropped its done sender, or `deadline` passed.
pub(super) fn wait_done(done: &Receiver<()>, deadline: Option<Instant>) -> bool {
    match deadline {
        None => done.recv().is_err(),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            matches!(done.recv_timeout(remaining), Err(RecvTimeoutError::Disconnected))
        }
    }
}

/// Spawn `max_threads` workers sharing one dispatch channel.
pub(super) fn spawn_workers(
    inner: &Arc<SchedulerInner>,
) -> Result<(Sender<WorkToken>, Generation), std::io::Error> {
    let workers = inner.options.max_threads;
    let (work_tx, work_rx) = bounded::<WorkToken>(workers.max(1));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (done_tx, done_rx) = bounded::<()>(0);

    for worker_id in 0..workers {
        let inner = Arc::clone(inner);
        let work_rx = work_rx.clone();
        let cancel_rx = cancel_rx.clone();
        let done = done_tx.clone();
        thread::Builder::new()
            .name(format!("{}-worker-{worker_id}", inner.options.name))
            .spawn(move || worker_main(&inner, worker_id, &work_rx, cancel_rx, done))?;
    }

    Ok((
        work_tx,
        Generation {
            done: done_rx,
            cancel: cancel_tx,
        },
    ))
}

fn worker_main(
    inner: &SchedulerInner,
    worker_id: usize,
    work_rx: &Receiver<WorkToken>,
    cancel: watch::Receiver<bool>,
    done: Sender<()>,
) {
    let ctx = match ExecutionContext::new(cancel) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(worker_id, error = %e, "failed to create worker runtime");
            inner.reporter.report(&EngineError::Spawn(e));
            return;
        }
    };
    debug!(scheduler = %inner.options.name, worker_id, "worker started");

    // Sender dropped on shutdown: recv fails once queued tokens are consumed.
    while work_rx.recv().is_ok() {
        let cycle = panic::catch_unwind(AssertUnwindSafe(|| drain(inner, &ctx)));
        if let Err(panic) = cycle {
            inner
                .reporter
                .report(&EngineError::WorkerPanic(panic_message(panic.as_ref())));
        }
        inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    debug!(scheduler = %inner.options.name, worker_id, "worker exiting");
    drop(done);
}

/// Claim and perform until nothing is claimable or shutdown began.
fn drain(inner: &SchedulerInner, ctx: &ExecutionContext) {
    loop {
        let execution = {
            let accepting = inner.accepting.read();
            if !*accepting {
                return;
            }
            match inner.performer.claim() {
                Ok(Some(execution)) => execution,
                Ok(None) => {
                    inner.record(&ExecutionResult::NoWork);
                    return;
                }
                Err(e) => {
                    inner.reporter.report(&EngineError::Store(e));
                    return;
                }
            }
        };

        match inner.performer.perform(execution, ctx) {
            Ok(result) => {
                inner.record(&result);
                inner.maybe_cleanup();
                if matches!(result, ExecutionResult::Errored { event: ErrorEvent::Retried, .. }) {
                    inner.warm_cache();
                }
            }
            Err(e) => {
                inner.reporter.report(&EngineError::Store(e));
                return;
            }
        }
    }
}
